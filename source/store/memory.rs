use crate::store::{self, Entry, Folder, Message, Store, Window};
use std::{collections, sync, time};

#[derive(Debug)]
struct State {
  folders: Vec<Folder>,
  // Keyed (and therefore ordered) by id.
  messages: collections::BTreeMap<u64, Message>,
  next: u64,
  generation: u64,
}

impl State {
  fn ids(&self, folder: &str) -> Vec<u64> {
    self
      .messages
      .values()
      .filter(|message| message.folder == folder)
      .map(|message| message.id)
      .collect()
  }

  fn changed(&mut self) {
    self.generation += 1;
  }
}

// Everything lives behind one lock, waiters are woken up on every change.
#[derive(Debug)]
pub struct Memory {
  state: sync::Mutex<State>,
  changes: sync::Condvar,
}

impl Default for Memory {
  fn default() -> Self {
    Self::new()
  }
}

impl Memory {
  pub fn new() -> Self {
    Self {
      state: sync::Mutex::new(State {
        folders: store::default_folders(),
        messages: collections::BTreeMap::new(),
        next: 1,
        generation: 0,
      }),
      changes: sync::Condvar::new(),
    }
  }

  fn lock(&self) -> anyhow::Result<sync::MutexGuard<State>> {
    self
      .state
      .lock()
      .map_err(|_| anyhow::anyhow!("memory store poisoned"))
  }
}

impl Store for Memory {
  fn folders(&self) -> anyhow::Result<Vec<Folder>> {
    Ok(self.lock()?.folders.clone())
  }

  fn count(&self, folder: &str) -> anyhow::Result<u64> {
    Ok(
      self
        .lock()?
        .messages
        .values()
        .filter(|message| message.folder == folder)
        .count() as u64,
    )
  }

  fn count_unseen(&self, folder: &str) -> anyhow::Result<u64> {
    Ok(
      self
        .lock()?
        .messages
        .values()
        .filter(|message| message.folder == folder && !message.seen())
        .count() as u64,
    )
  }

  fn uids(&self, folder: &str) -> anyhow::Result<Vec<u64>> {
    Ok(self.lock()?.ids(folder))
  }

  fn query(&self, folder: &str, window: &Window) -> anyhow::Result<Vec<Entry>> {
    let state = self.lock()?;
    let ids = state.ids(folder);
    Ok(
      window
        .select(&ids)
        .into_iter()
        .filter_map(|(sequence, index)| {
          let message = state.messages.get(&ids[index])?;
          Some(Entry {
            sequence,
            message: Message {
              content: store::normalize(message.content.clone()),
              ..message.clone()
            },
          })
        })
        .collect(),
    )
  }

  fn mark_seen(&self, folder: &str, window: &Window) -> anyhow::Result<usize> {
    let mut state = self.lock()?;
    let ids = state.ids(folder);
    let mut changed = 0;
    for (_, index) in window.select(&ids) {
      if let Some(message) = state.messages.get_mut(&ids[index]) {
        if message.seen() {
          continue;
        }
        if !message.flags.is_empty() {
          message.flags.push(' ');
        }
        message.flags.push_str(store::SEEN);
        changed += 1;
      }
    }
    if changed > 0 {
      state.changed();
      self.changes.notify_all();
    }
    Ok(changed)
  }

  fn append(&self, folder: &str, content: &[u8], flags: &str) -> anyhow::Result<u64> {
    let mut state = self.lock()?;
    anyhow::ensure!(
      state.folders.iter().any(|folder_| folder_.name == folder),
      "unknown folder {folder}"
    );
    let id = state.next;
    state.next += 1;
    state.messages.insert(
      id,
      Message {
        id,
        folder: folder.to_string(),
        content: content.to_vec(),
        flags: flags.split_whitespace().collect::<Vec<_>>().join(" "),
        internal_date: Some(chrono::Utc::now()),
      },
    );
    state.changed();
    self.changes.notify_all();
    Ok(id)
  }

  fn expunge(&self, folder: &str, id: u64) -> anyhow::Result<bool> {
    let mut state = self.lock()?;
    match state.messages.get(&id) {
      Some(message) if message.folder == folder => (),
      Some(_) | None => return Ok(false),
    }
    state.messages.remove(&id);
    state.changed();
    self.changes.notify_all();
    Ok(true)
  }

  fn generation(&self) -> u64 {
    self.lock().map(|state| state.generation).unwrap_or(0)
  }

  fn wait(&self, generation: u64, timeout: time::Duration) {
    let Ok(state) = self.lock() else {
      return;
    };
    // Spurious wake-ups are handled by wait_timeout_while.
    if let Err(error) = self
      .changes
      .wait_timeout_while(state, timeout, |state| state.generation == generation)
    {
      log::warn!("memory store poisoned while waiting: {error}");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;
  use std::thread;

  fn contents(entries: &[Entry]) -> Vec<(u64, u64, &str)> {
    entries
      .iter()
      .map(|entry| {
        (
          entry.sequence,
          entry.message.id,
          std::str::from_utf8(&entry.message.content).unwrap(),
        )
      })
      .collect()
  }

  #[test]
  fn folders() -> anyhow::Result<()> {
    let store = Memory::new();
    assert_eq!(
      vec!["INBOX", "Sent", "Drafts", "Trash"],
      store
        .folders()?
        .iter()
        .map(|folder| folder.name.as_str())
        .collect::<Vec<_>>()
    );
    assert!(store.append("Archive", b"a", "").is_err());
    Ok(())
  }

  #[test]
  fn membership() -> anyhow::Result<()> {
    let store = Memory::new();
    store.append("INBOX", b"1", "")?;
    store.append("Sent", b"2", "\\Seen")?;
    store.append("INBOX", b"3", "")?;
    assert_eq!(2, store.count("INBOX")?);
    assert_eq!(1, store.count("Sent")?);
    assert_eq!(0, store.count("Unknown")?);
    assert_eq!(0, store.count_unseen("Sent")?);
    assert_eq!(vec![1, 3], store.uids("INBOX")?);
    assert_eq!(Some(3), store.last_uid("INBOX")?);
    assert_eq!(None, store.last_uid("Trash")?);
    Ok(())
  }

  #[test]
  fn query() -> anyhow::Result<()> {
    let store = Memory::new();
    for content in ["a\n", "b\r\n", "c\n", "d\n"] {
      store.append("INBOX", content.as_bytes(), "")?;
    }
    store.append("Sent", b"e", "")?;
    assert!(store.expunge("INBOX", 2)?);
    assert_eq!(
      vec![(1, 1, "a\r\n"), (2, 3, "c\r\n"), (3, 4, "d\r\n")],
      contents(&store.query("INBOX", &Window::All)?)
    );
    assert_eq!(
      vec![(2, 3, "c\r\n"), (3, 4, "d\r\n")],
      contents(&store.query("INBOX", &Window::Positions(2..=7))?)
    );
    assert_eq!(
      vec![(3, 4, "d\r\n")],
      contents(&store.query("INBOX", &Window::Uids(4..=5))?)
    );
    Ok(())
  }

  #[test]
  fn mark_seen() -> anyhow::Result<()> {
    let store = Memory::new();
    store.append("INBOX", b"a", "")?;
    store.append("INBOX", b"b", "\\Flagged")?;
    store.append("INBOX", b"c", "\\Seen")?;
    assert_eq!(2, store.mark_seen("INBOX", &Window::Uids(1..=3))?);
    let flags = |store: &Memory| -> anyhow::Result<Vec<String>> {
      Ok(
        store
          .query("INBOX", &Window::All)?
          .into_iter()
          .map(|entry| entry.message.flags)
          .collect(),
      )
    };
    let once = flags(&store)?;
    assert_eq!(vec!["\\Seen", "\\Flagged \\Seen", "\\Seen"], once);
    assert_eq!(0, store.mark_seen("INBOX", &Window::All)?);
    assert_eq!(once, flags(&store)?);
    assert_eq!(0, store.count_unseen("INBOX")?);
    Ok(())
  }

  #[test]
  fn expunge() -> anyhow::Result<()> {
    let store = Memory::new();
    let id = store.append("INBOX", b"a", "")?;
    assert!(!store.expunge("Sent", id)?);
    assert!(store.expunge("INBOX", id)?);
    assert!(!store.expunge("INBOX", id)?);
    Ok(())
  }

  #[test]
  fn wait() -> anyhow::Result<()> {
    let store = sync::Arc::new(Memory::new());
    let generation = store.generation();

    // Nothing happens.
    let start = time::Instant::now();
    store.wait(generation, time::Duration::from_millis(20));
    assert!(start.elapsed() >= time::Duration::from_millis(20));

    // Woken up by an append well before the timeout.
    let appender = {
      let store = store.clone();
      thread::spawn(move || {
        thread::sleep(time::Duration::from_millis(20));
        store.append("INBOX", b"a", "")
      })
    };
    let start = time::Instant::now();
    store.wait(generation, time::Duration::from_secs(30));
    assert!(start.elapsed() < time::Duration::from_secs(30));
    appender.join().unwrap()?;
    assert!(store.generation() > generation);
    Ok(())
  }
}
