use anyhow::{Result, bail};
use std::io::{self, BufRead, IsTerminal};
use zeroize::Zeroizing;

pub const ENV_PASSWORD: &str = "DURESSVAULT_PASSWORD";

/// Password used to open the vault.
///
/// Looked up in order: `DURESSVAULT_PASSWORD`, one line of piped stdin,
/// then an interactive prompt.
pub fn read_password() -> Result<Zeroizing<String>> {
    //  DURESSVAULT_PASSWORD="..." duressvault list
    if let Ok(pw) = std::env::var(ENV_PASSWORD) {
        if !pw.is_empty() {
            return Ok(Zeroizing::new(pw));
        }
    }

    //  printf "%s\n" "$PW" | duressvault list
    if !io::stdin().is_terminal() {
        let pw = read_line()?;
        if !pw.is_empty() {
            return Ok(pw);
        }
    }

    if io::stdin().is_terminal() {
        let pw = Zeroizing::new(rpassword::prompt_password("Password: ")?);
        if !pw.is_empty() {
            return Ok(pw);
        }
    }

    bail!("No password provided")
}

/// A password that is not taken from the environment, e.g. the current
/// password of another kind when changing it.
pub fn read_secondary(prompt: &str) -> Result<Zeroizing<String>> {
    let pw = if io::stdin().is_terminal() {
        Zeroizing::new(rpassword::prompt_password(prompt)?)
    } else {
        read_line()?
    };
    if pw.is_empty() {
        bail!("password cannot be empty");
    }
    Ok(pw)
}

/// New password, entered twice. Piped stdin supplies both lines.
pub fn read_new_password_with_confirmation(label: &str) -> Result<Zeroizing<String>> {
    let (pw1, pw2) = if io::stdin().is_terminal() {
        (
            Zeroizing::new(rpassword::prompt_password(format!("New {label} password: "))?),
            Zeroizing::new(rpassword::prompt_password(format!("Confirm {label} password: "))?),
        )
    } else {
        (read_line()?, read_line()?)
    };

    if pw1.is_empty() {
        bail!("{label} password cannot be empty");
    }

    if pw1 != pw2 {
        bail!("{label} passwords do not match");
    }

    Ok(pw1)
}

/// The three passwords for `init`, each confirmed.
pub fn read_initial_passwords() -> Result<[Zeroizing<String>; 3]> {
    Ok([
        read_new_password_with_confirmation("master")?,
        read_new_password_with_confirmation("decoy")?,
        read_new_password_with_confirmation("panic")?,
    ])
}

fn read_line() -> Result<Zeroizing<String>> {
    let stdin = io::stdin();
    let mut handle = stdin.lock();
    let mut buf = Zeroizing::new(String::new());
    handle.read_line(&mut buf)?;
    trim_newline(&mut buf);
    Ok(buf)
}

fn trim_newline(s: &mut String) {
    while s.ends_with('\n') || s.ends_with('\r') {
        s.pop();
    }
}
