//! Fabricated documents served to a decoy session.
//!
//! The catalogue is fixed; its content is generated from a seed derived
//! from the decoy key, so the same vault shows the same files every time.
//! Nothing here can reach the real vault key or the real store.
//!
//! The decoy name set never grows: a decoy session may delete or tag
//! catalogue files (in memory, gone with the provider) but cannot add or
//! rename one, so no name typed during a decoy session can ever coincide
//! with a name in the real store.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::debug;
use zeroize::Zeroizing;

use crate::crypto::SecureBuffer;
use crate::error::{VaultError, VaultResult};
use crate::keys::SessionKey;
use crate::store::{FileMetadataEntry, MetadataIndex};

const SEED_LABEL: &[u8] = b"duressvault.decoy.seed.v1";
/// Same text a real store reports for a failed blob write.
const WRITE_REFUSED: &str = "write failed";

#[derive(Debug, Clone, Copy)]
enum DocumentKind {
    Notes,
    Budget,
    Checklist,
    Reading,
    Pdf,
    Jpeg,
    Zip,
    Docx,
}

const CATALOGUE: [(&str, DocumentKind); 8] = [
    ("Meeting_Notes_March.txt", DocumentKind::Notes),
    ("Quarterly_Budget.csv", DocumentKind::Budget),
    ("Moving_Checklist.md", DocumentKind::Checklist),
    ("Book_Recommendations.txt", DocumentKind::Reading),
    ("Travel_Itinerary.pdf", DocumentKind::Pdf),
    ("IMG_2041.jpg", DocumentKind::Jpeg),
    ("Tax_Documents_2023.zip", DocumentKind::Zip),
    ("Cover_Letter.docx", DocumentKind::Docx),
];

/// Deterministic byte stream: SHA-256 in counter mode over the seed.
struct SeedStream<'a> {
    seed: &'a [u8; 32],
    label: &'a str,
    counter: u64,
    block: [u8; 32],
    pos: usize,
}

impl<'a> SeedStream<'a> {
    fn new(seed: &'a [u8; 32], label: &'a str) -> Self {
        Self {
            seed,
            label,
            counter: 0,
            block: [0; 32],
            pos: 32,
        }
    }

    fn next_byte(&mut self) -> u8 {
        if self.pos == self.block.len() {
            let mut hasher = Sha256::new();
            hasher.update(self.seed);
            hasher.update(self.label.as_bytes());
            hasher.update(self.counter.to_le_bytes());
            self.block = hasher.finalize().into();
            self.counter += 1;
            self.pos = 0;
        }
        let b = self.block[self.pos];
        self.pos += 1;
        b
    }

    fn next_u32(&mut self) -> u32 {
        u32::from_le_bytes([
            self.next_byte(),
            self.next_byte(),
            self.next_byte(),
            self.next_byte(),
        ])
    }

    fn below(&mut self, bound: u32) -> u32 {
        self.next_u32() % bound
    }

    fn pick<'s>(&mut self, options: &[&'s str]) -> &'s str {
        options[self.below(options.len() as u32) as usize]
    }

    fn bytes(&mut self, len: usize) -> Vec<u8> {
        (0..len).map(|_| self.next_byte()).collect()
    }
}

struct DecoyState {
    index: MetadataIndex,
    contents: BTreeMap<String, SecureBuffer>,
}

pub struct DecoyProvider {
    state: Mutex<DecoyState>,
}

impl DecoyProvider {
    /// Builds the catalogue from the decoy key. Only a hash of the key is
    /// kept, and only while the catalogue is generated.
    pub fn new(dvmk: &SessionKey) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(SEED_LABEL);
        hasher.update(dvmk.bytes());
        let seed: Zeroizing<[u8; 32]> = Zeroizing::new(hasher.finalize().into());

        let mut index = MetadataIndex::new();
        let mut contents = BTreeMap::new();
        for (name, kind) in CATALOGUE {
            let content = generate(&seed, name, kind);
            let blob_id = catalogue_id(&seed, name);
            let entry = FileMetadataEntry::new(name, blob_id.clone(), &content)
                .with_timestamp(catalogue_timestamp(&seed, name));
            // names in CATALOGUE are unique
            let _ = index.insert(entry);
            contents.insert(blob_id, SecureBuffer::new(content));
        }

        debug!(files = CATALOGUE.len(), "decoy catalogue generated");
        Self {
            state: Mutex::new(DecoyState { index, contents }),
        }
    }

    /// Names the real store must never accept.
    pub fn reserved_names() -> BTreeSet<String> {
        CATALOGUE.iter().map(|(name, _)| name.to_string()).collect()
    }

    pub fn list(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .map(|e| e.original_name().to_string())
            .collect()
    }

    /// Entries in the same shape a real session would list, ordered by name.
    pub fn entries(&self) -> Vec<FileMetadataEntry> {
        let state = self.state.lock();
        let mut entries: Vec<_> = state.index.entries().cloned().collect();
        entries.sort_by(|a, b| a.original_name().cmp(b.original_name()));
        entries
    }

    pub fn read(&self, name: &str) -> VaultResult<SecureBuffer> {
        let blob_id = {
            let state = self.state.lock();
            state
                .index
                .entries()
                .find(|e| e.original_name() == name)
                .map(|e| e.blob_id().to_string())
        };
        match blob_id {
            Some(id) => self.retrieve(&id),
            None => Err(VaultError::FileNotFound(name.to_string())),
        }
    }

    pub fn retrieve(&self, blob_id: &str) -> VaultResult<SecureBuffer> {
        let state = self.state.lock();
        state
            .contents
            .get(blob_id)
            .map(|c| SecureBuffer::new(c.as_slice().to_vec()))
            .ok_or_else(|| VaultError::FileNotFound(blob_id.to_string()))
    }

    /// Always refused. Adding a name could collide with a real one.
    pub fn store(&self, name: &str, _plaintext: &[u8]) -> VaultResult<String> {
        debug!(name_len = name.len(), "decoy store refused");
        Err(VaultError::StorageFailure(WRITE_REFUSED.into()))
    }

    pub fn delete(&self, blob_id: &str) -> VaultResult<()> {
        let mut state = self.state.lock();
        state.index.remove(blob_id)?;
        state.contents.remove(blob_id);
        Ok(())
    }

    /// Refused for the same reason as [`store`](Self::store); an unknown
    /// id still reports `FileNotFound` first.
    pub fn rename(&self, blob_id: &str, _new_name: &str) -> VaultResult<()> {
        if self.state.lock().index.get(blob_id).is_none() {
            return Err(VaultError::FileNotFound(blob_id.to_string()));
        }
        Err(VaultError::StorageFailure(WRITE_REFUSED.into()))
    }

    pub fn set_tags(&self, blob_id: &str, tags: Vec<String>) -> VaultResult<()> {
        self.state.lock().index.set_tags(blob_id, tags)
    }
}

fn catalogue_id(seed: &[u8; 32], name: &str) -> String {
    let label = format!("id:{name}");
    let bytes = SeedStream::new(seed, &label).bytes(16);
    hex::encode(bytes)
}

/// Somewhere in the year before 2024-06-01, fixed per vault and name.
fn catalogue_timestamp(seed: &[u8; 32], name: &str) -> DateTime<Utc> {
    let label = format!("ts:{name}");
    let mut stream = SeedStream::new(seed, &label);
    let base = Utc
        .with_ymd_and_hms(2024, 6, 1, 9, 0, 0)
        .single()
        .unwrap_or_else(Utc::now);
    base - Duration::days(i64::from(stream.below(365)))
        - Duration::minutes(i64::from(stream.below(24 * 60)))
}

fn generate(seed: &[u8; 32], name: &str, kind: DocumentKind) -> Vec<u8> {
    let mut stream = SeedStream::new(seed, name);
    match kind {
        DocumentKind::Notes => notes(&mut stream),
        DocumentKind::Budget => budget(&mut stream),
        DocumentKind::Checklist => checklist(&mut stream),
        DocumentKind::Reading => reading(&mut stream),
        DocumentKind::Pdf => pdf(&mut stream),
        DocumentKind::Jpeg => jpeg(&mut stream),
        DocumentKind::Zip => zip(&mut stream, &["W2_2023.pdf", "1099-INT.pdf", "receipts.xlsx"]),
        DocumentKind::Docx => zip(
            &mut stream,
            &["[Content_Types].xml", "_rels/.rels", "word/document.xml"],
        ),
    }
}

fn notes(s: &mut SeedStream) -> Vec<u8> {
    let attendees = ["Dana", "Priya", "Marcus", "Elena", "Tom", "Yusuf"];
    let topics = [
        "vendor contract renewal",
        "Q2 hiring plan",
        "office move timeline",
        "customer survey results",
        "budget reforecast",
    ];
    let mut out = format!(
        "Team sync - March {}\n\nAttendees: {}, {}, {}\n\n",
        s.below(28) + 1,
        s.pick(&attendees),
        s.pick(&attendees),
        s.pick(&attendees),
    );
    for i in 1..=3 {
        out.push_str(&format!("{i}. {}\n", s.pick(&topics)));
    }
    out.push_str(&format!(
        "\nAction items:\n- {} to send follow-up by Friday\n- Revisit numbers next week\n",
        s.pick(&attendees)
    ));
    out.into_bytes()
}

fn budget(s: &mut SeedStream) -> Vec<u8> {
    let mut out = String::from("Category,Q1,Q2,Q3,Q4\n");
    for category in ["Rent", "Payroll", "Software", "Travel", "Marketing", "Utilities"] {
        out.push_str(category);
        for _ in 0..4 {
            out.push_str(&format!(",{}.{:02}", 200 + s.below(9_800), s.below(100)));
        }
        out.push('\n');
    }
    out.into_bytes()
}

fn checklist(s: &mut SeedStream) -> Vec<u8> {
    let tasks = [
        "Book movers",
        "Forward mail",
        "Cancel gym membership",
        "Transfer utilities",
        "Update address with bank",
        "Pack kitchen",
        "Return router",
    ];
    let mut out = String::from("# Moving checklist\n\n");
    for task in tasks {
        let done = if s.below(2) == 0 { "x" } else { " " };
        out.push_str(&format!("- [{done}] {task}\n"));
    }
    out.into_bytes()
}

fn reading(s: &mut SeedStream) -> Vec<u8> {
    let books = [
        "The Overstory - Richard Powers",
        "Piranesi - Susanna Clarke",
        "A Gentleman in Moscow - Amor Towles",
        "Project Hail Mary - Andy Weir",
        "The Remains of the Day - Kazuo Ishiguro",
        "Educated - Tara Westover",
    ];
    let mut out = String::from("Books people recommended\n\n");
    for _ in 0..4 {
        out.push_str(&format!("* {}\n", s.pick(&books)));
    }
    out.into_bytes()
}

fn pdf(s: &mut SeedStream) -> Vec<u8> {
    let mut out = b"%PDF-1.4\n%\xe2\xe3\xcf\xd3\n".to_vec();
    out.extend_from_slice(b"1 0 obj\n<< /Type /Catalog /Pages 2 0 R >>\nendobj\n");
    out.extend_from_slice(b"2 0 obj\n<< /Type /Pages /Kids [] /Count 0 >>\nendobj\n");
    let len = 2048 + s.below(2048) as usize;
    let body = s.bytes(len);
    out.extend_from_slice(format!("3 0 obj\n<< /Length {} /Filter /FlateDecode >>\nstream\n", body.len()).as_bytes());
    out.extend_from_slice(&body);
    out.extend_from_slice(b"\nendstream\nendobj\n%%EOF\n");
    out
}

fn jpeg(s: &mut SeedStream) -> Vec<u8> {
    let mut out = vec![
        0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00, 0x01, 0x01, 0x00, 0x00,
        0x48, 0x00, 0x48, 0x00, 0x00,
    ];
    let len = 8192 + s.below(4096) as usize;
    out.extend(s.bytes(len));
    out.extend_from_slice(&[0xFF, 0xD9]);
    out
}

/// Local file headers for `members` with random bodies, then an empty
/// end-of-central-directory record.
fn zip(s: &mut SeedStream, members: &[&str]) -> Vec<u8> {
    let mut out = Vec::new();
    for member in members {
        let len = 512 + s.below(1024) as usize;
        let body = s.bytes(len);
        out.extend_from_slice(b"PK\x03\x04");
        out.extend_from_slice(&[0x14, 0x00, 0x00, 0x00, 0x08, 0x00]);
        out.extend_from_slice(&[0; 4]);
        out.extend_from_slice(&s.next_u32().to_le_bytes());
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&(body.len() as u32 * 3).to_le_bytes());
        out.extend_from_slice(&(member.len() as u16).to_le_bytes());
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(member.as_bytes());
        out.extend_from_slice(&body);
    }
    out.extend_from_slice(b"PK\x05\x06");
    out.extend_from_slice(&[0; 18]);
    out
}
