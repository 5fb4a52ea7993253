use std::{ops, thread, time};

pub mod maildir;
pub mod memory;

pub use maildir::Maildir;
pub use memory::Memory;

pub const INBOX: &str = "INBOX";
pub const SEEN: &str = "\\Seen";

#[derive(Clone, Debug, PartialEq)]
pub struct Folder {
  pub name: String,
  pub attributes: Vec<String>,
}

// The folders every store starts with.
pub fn default_folders() -> Vec<Folder> {
  [
    (INBOX, None),
    ("Sent", None),
    ("Drafts", Some("\\Drafts")),
    ("Trash", Some("\\Trash")),
  ]
  .into_iter()
  .map(|(name, attribute)| Folder {
    name: name.to_string(),
    attributes: attribute.into_iter().map(str::to_string).collect(),
  })
  .collect()
}

#[derive(Clone, Debug, PartialEq)]
pub struct Message {
  // Doubles as the UID.
  pub id: u64,
  pub folder: String,
  pub content: Vec<u8>,
  // Whitespace separated.
  pub flags: String,
  pub internal_date: Option<chrono::DateTime<chrono::Utc>>,
}

impl Message {
  pub fn seen(&self) -> bool {
    is_seen(&self.flags)
  }
}

pub fn is_seen(flags: &str) -> bool {
  flags
    .split_whitespace()
    .any(|flag| flag.eq_ignore_ascii_case(SEEN))
}

// Messages stored with bare LF line endings are served with CRLF, the literal lengths given to
// clients are computed on the normalized content.
pub fn normalize(content: Vec<u8>) -> Vec<u8> {
  if memchr::memmem::find(&content, b"\r\n").is_some() {
    return content;
  }
  let mut normalized = Vec::with_capacity(content.len() + memchr::memchr_iter(b'\n', &content).count());
  for byte in content {
    if byte == b'\n' {
      normalized.push(b'\r');
    }
    normalized.push(byte);
  }
  normalized
}

#[derive(Clone, Debug, PartialEq)]
pub enum Window {
  All,
  // 1-based ranks in ascending id order, inclusive.
  Positions(ops::RangeInclusive<u64>),
  Uids(ops::RangeInclusive<u64>),
}

impl Window {
  // Given the ascending ids of a folder, returns the (sequence number, index) of the selected ones.
  pub fn select(&self, ids: &[u64]) -> Vec<(u64, usize)> {
    ids
      .iter()
      .enumerate()
      .map(|(index, id)| (index as u64 + 1, index, *id))
      .filter(|(sequence, _, id)| match self {
        Window::All => true,
        Window::Positions(positions) => positions.contains(sequence),
        Window::Uids(uids) => uids.contains(id),
      })
      .map(|(sequence, index, _)| (sequence, index))
      .collect()
  }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Entry {
  pub sequence: u64,
  pub message: Message,
}

// Implementations serialize their own accesses: sessions share a single instance.
pub trait Store: Send + Sync {
  fn folders(&self) -> anyhow::Result<Vec<Folder>>;

  fn count(&self, folder: &str) -> anyhow::Result<u64>;

  fn count_unseen(&self, folder: &str) -> anyhow::Result<u64>;

  // Ascending.
  fn uids(&self, folder: &str) -> anyhow::Result<Vec<u64>>;

  fn last_uid(&self, folder: &str) -> anyhow::Result<Option<u64>> {
    Ok(self.uids(folder)?.last().copied())
  }

  // Ordered by ascending id, with their sequence number at the time of the query.
  fn query(&self, folder: &str, window: &Window) -> anyhow::Result<Vec<Entry>>;

  // Adds \Seen to the selected messages lacking it, returns how many changed.
  fn mark_seen(&self, folder: &str, window: &Window) -> anyhow::Result<usize>;

  fn append(&self, folder: &str, content: &[u8], flags: &str) -> anyhow::Result<u64>;

  fn expunge(&self, folder: &str, id: u64) -> anyhow::Result<bool>;

  // A counter bumped on every change, for stores able to notify.
  fn generation(&self) -> u64 {
    0
  }

  // Returns once the generation moved past the given one or after the timeout. Stores that can't
  // notify make this a plain poll interval.
  fn wait(&self, generation: u64, timeout: time::Duration) {
    let _ = generation;
    thread::sleep(timeout)
  }
}

fn sample(from: &str, subject: &str, date: chrono::DateTime<chrono::Utc>, body: &str) -> String {
  format!(
    "From: {from}\r\nTo: user@example.com\r\nSubject: {subject}\r\nDate: {}\r\n\r\n{body}",
    date.to_rfc2822()
  )
}

// Only touches an empty store.
pub fn seed(store: &dyn Store) -> anyhow::Result<()> {
  for folder in store.folders()? {
    if store.count(&folder.name)? > 0 {
      return Ok(());
    }
  }
  let now = chrono::Utc::now();
  for message in [
    sample(
      "admin@example.com",
      "Welcome to Postern",
      now,
      "Hello user@example.com,\r\nThis is your first test mail!\r\n",
    ),
    sample(
      "boss@example.com",
      "Meeting Reminder",
      now - chrono::Duration::hours(2),
      "Don't forget our meeting at 3PM today.\r\n",
    ),
  ] {
    store.append(INBOX, message.as_bytes(), "")?;
  }
  log::info!("inserted sample messages into {INBOX}");
  Ok(())
}
