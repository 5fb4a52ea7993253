// https://cr.yp.to/proto/maildir.html - Maildir
// https://www.courier-mta.org/imap/README.maildirquota.html - Maildir++
// https://doc.dovecot.org/admin_manual/mailbox_formats/maildir/ - Maildir Mailbox Format
//
// Messages live in cur/ as <uid>:2,<info> so the UID survives restarts. Anything delivered to new/
// (or oddly named in cur/) is adopted with the next UID the first time the folder is looked at.
// Changes made behind the server's back can't be notified, IDLE falls back to polling.

use crate::{
  imap,
  store::{self, Entry, Folder, Message, Store, Window},
};
use anyhow::Context as _;
use std::{
  fs,
  io::{self, Write as _},
  path, sync,
};

// https://cr.yp.to/proto/maildir.html
// Flag "D" (draft), "F" (flagged), "R" (replied), "S" (seen), "T" (trashed). Flags must be stored
// in ASCII order.
const LETTERS: [(char, &str); 5] = [
  ('D', "\\Draft"),
  ('F', "\\Flagged"),
  ('R', "\\Answered"),
  ('S', store::SEEN),
  ('T', "\\Deleted"),
];

const INFO: &str = ":2,";

fn letters_to_flags(letters: &str) -> String {
  LETTERS
    .iter()
    .filter(|(letter, _)| letters.contains(*letter))
    .map(|(_, flag)| *flag)
    .collect::<Vec<_>>()
    .join(" ")
}

// Keywords have no Maildir letter and are dropped.
fn flags_to_letters(flags: &str) -> String {
  LETTERS
    .iter()
    .filter(|(_, flag)| {
      flags
        .split_whitespace()
        .any(|flag_| flag_.eq_ignore_ascii_case(flag))
    })
    .map(|(letter, _)| *letter)
    .collect()
}

fn with_letter(letters: &str, letter: char) -> String {
  let mut letters: Vec<char> = letters.chars().chain([letter]).collect();
  letters.sort_unstable();
  letters.dedup();
  letters.into_iter().collect()
}

#[derive(Debug)]
struct File {
  uid: u64,
  path: path::PathBuf,
  letters: String,
}

// None when the name wasn't given by this store.
fn parse_name(name: &str) -> Option<(u64, &str)> {
  let (uid, letters) = name.split_once(INFO)?;
  Some((uid.parse().ok()?, letters))
}

#[derive(Debug)]
pub struct Maildir {
  root: path::PathBuf,
  // Next UID to hand out, also serializes every access to the tree.
  next: sync::Mutex<u64>,
}

impl Maildir {
  pub fn open(root: &path::Path) -> anyhow::Result<Self> {
    fs::create_dir_all(root).with_context(|| format!("couldn't create {root:?}"))?;
    let root = root.canonicalize()?;
    let mut next = match fs::read_to_string(root.join("uidnext")) {
      Ok(uidnext) => uidnext
        .trim()
        .parse()
        .with_context(|| format!("invalid uidnext in {root:?}"))?,
      Err(error) if error.kind() == io::ErrorKind::NotFound => 1,
      Err(error) => Err(error)?,
    };
    let maildir = Self {
      root,
      next: sync::Mutex::new(1),
    };
    for folder in store::default_folders() {
      let directory = maildir
        .directory(&folder.name)
        .with_context(|| format!("no directory for {}", folder.name))?;
      for subdirectory in ["cur", "new", "tmp"] {
        fs::create_dir_all(directory.join(subdirectory))?;
      }
      if folder.name != store::INBOX {
        // https://www.courier-mta.org/imap/README.maildirquota.html
        // Within each subdirectory there's an empty file, maildirfolder.
        fs::File::create(directory.join("maildirfolder"))?;
      }
      for entry in fs::read_dir(directory.join("cur"))? {
        if let Some((uid, _)) = entry?.file_name().to_str().and_then(parse_name) {
          next = next.max(uid + 1);
        }
      }
    }
    *maildir.lock()? = next;
    log::info!("opened maildir {:?}, next UID is {next}", maildir.root);
    Ok(maildir)
  }

  fn lock(&self) -> anyhow::Result<sync::MutexGuard<u64>> {
    self
      .next
      .lock()
      .map_err(|_| anyhow::anyhow!("maildir store poisoned"))
  }

  // Only the folders the store knows about map to a directory, a client supplied name never
  // reaches the file system as is.
  fn directory(&self, folder: &str) -> Option<path::PathBuf> {
    if folder.eq_ignore_ascii_case(store::INBOX) {
      // https://doc.dovecot.org/admin_manual/mailbox_formats/maildir/#directory-structure
      // ~/Maildir/new, ~/Maildir/cur and ~/Maildir/tmp directories contain the messages for INBOX.
      return Some(self.root.clone());
    }
    let name = imap::decode_mailbox(folder).unwrap_or_else(|| folder.to_string());
    if !store::default_folders()
      .iter()
      .any(|folder_| folder_.name == name)
    {
      return None;
    }
    // ~/Maildir/.folder.subfolder/ is a subfolder of a folder (i.e. folder/subfolder).
    Some(self.root.join(format!(".{}", name.replace('/', "."))))
  }

  fn allocate(&self, next: &mut u64) -> anyhow::Result<u64> {
    let uid = *next;
    *next += 1;
    let mut file = fs::File::create(self.root.join("uidnext"))?;
    file.write_all(next.to_string().as_bytes())?;
    file.sync_all()?;
    Ok(uid)
  }

  // Ascending UIDs, adopting any file that doesn't have one yet. Both listings are taken before
  // anything is renamed so an adopted file isn't seen twice.
  fn scan(&self, folder: &str, next: &mut u64) -> anyhow::Result<Vec<File>> {
    let Some(directory) = self.directory(folder) else {
      return Ok(Vec::new());
    };
    let cur = directory.join("cur");
    if !cur.is_dir() {
      return Ok(Vec::new());
    }
    let mut listing = Vec::new();
    for subdirectory in ["new", "cur"] {
      for entry in fs::read_dir(directory.join(subdirectory))? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
          continue;
        }
        let name = entry.file_name();
        let name = name
          .to_str()
          .with_context(|| format!("couldn't convert {name:?} to string"))?
          .to_string();
        listing.push((subdirectory, entry.path(), name));
      }
    }

    let mut files = Vec::with_capacity(listing.len());
    for (subdirectory, path, name) in listing {
      match parse_name(&name) {
        Some((uid, letters)) if subdirectory == "cur" => files.push(File {
          uid,
          path,
          letters: letters.to_string(),
        }),
        Some(_) | None => {
          let letters = name.split_once(INFO).map_or("", |(_, letters)| letters);
          let uid = self.allocate(next)?;
          let adopted = cur.join(format!("{uid}{INFO}{letters}"));
          fs::rename(&path, &adopted)?;
          log::debug!("adopted {path:?} as UID {uid} in {folder}");
          files.push(File {
            uid,
            path: adopted,
            letters: letters.to_string(),
          });
        }
      }
    }
    files.sort_unstable_by_key(|file| file.uid);
    Ok(files)
  }

  fn read(&self, folder: &str, file: &File) -> anyhow::Result<Message> {
    let content = fs::read(&file.path).with_context(|| format!("couldn't read {:?}", file.path))?;
    let internal_date = fs::metadata(&file.path)?
      .modified()
      .ok()
      .map(chrono::DateTime::<chrono::Utc>::from);
    Ok(Message {
      id: file.uid,
      folder: folder.to_string(),
      content: store::normalize(content),
      flags: letters_to_flags(&file.letters),
      internal_date,
    })
  }

  fn find(&self, folder: &str, next: &mut u64, window: &Window) -> anyhow::Result<Vec<(u64, File)>> {
    let mut files: Vec<Option<File>> = self.scan(folder, next)?.into_iter().map(Some).collect();
    let uids: Vec<u64> = files.iter().flatten().map(|file| file.uid).collect();
    Ok(
      window
        .select(&uids)
        .into_iter()
        .filter_map(|(sequence, index)| Some((sequence, files[index].take()?)))
        .collect(),
    )
  }
}

impl Store for Maildir {
  fn folders(&self) -> anyhow::Result<Vec<Folder>> {
    Ok(store::default_folders())
  }

  fn count(&self, folder: &str) -> anyhow::Result<u64> {
    let mut next = self.lock()?;
    Ok(self.scan(folder, &mut next)?.len() as u64)
  }

  fn count_unseen(&self, folder: &str) -> anyhow::Result<u64> {
    let mut next = self.lock()?;
    Ok(
      self
        .scan(folder, &mut next)?
        .iter()
        .filter(|file| !file.letters.contains('S'))
        .count() as u64,
    )
  }

  fn uids(&self, folder: &str) -> anyhow::Result<Vec<u64>> {
    let mut next = self.lock()?;
    Ok(
      self
        .scan(folder, &mut next)?
        .iter()
        .map(|file| file.uid)
        .collect(),
    )
  }

  fn query(&self, folder: &str, window: &Window) -> anyhow::Result<Vec<Entry>> {
    let mut next = self.lock()?;
    self
      .find(folder, &mut next, window)?
      .into_iter()
      .map(|(sequence, file)| {
        Ok(Entry {
          sequence,
          message: self.read(folder, &file)?,
        })
      })
      .collect()
  }

  fn mark_seen(&self, folder: &str, window: &Window) -> anyhow::Result<usize> {
    let mut next = self.lock()?;
    let mut changed = 0;
    for (_, file) in self.find(folder, &mut next, window)? {
      if file.letters.contains('S') {
        continue;
      }
      let path = file.path.with_file_name(format!(
        "{}{INFO}{}",
        file.uid,
        with_letter(&file.letters, 'S')
      ));
      fs::rename(&file.path, path)?;
      changed += 1;
    }
    Ok(changed)
  }

  fn append(&self, folder: &str, content: &[u8], flags: &str) -> anyhow::Result<u64> {
    let directory = self
      .directory(folder)
      .with_context(|| format!("unknown folder {folder}"))?;
    let mut next = self.lock()?;
    // https://cr.yp.to/proto/maildir.html
    // A unique name can be anything that doesn't contain a colon (or slash) and doesn't start with
    // a dot. The file only leaves tmp/ once fully written.
    let tmp = directory
      .join("tmp")
      .join(uuid::Uuid::new_v4().hyphenated().to_string());
    let mut file = fs::File::create(&tmp)?;
    file.write_all(content)?;
    file.sync_all()?;
    let uid = self.allocate(&mut next)?;
    fs::rename(
      &tmp,
      directory
        .join("cur")
        .join(format!("{uid}{INFO}{}", flags_to_letters(flags))),
    )?;
    Ok(uid)
  }

  fn expunge(&self, folder: &str, id: u64) -> anyhow::Result<bool> {
    let mut next = self.lock()?;
    match self
      .scan(folder, &mut next)?
      .into_iter()
      .find(|file| file.uid == id)
    {
      Some(file) => {
        fs::remove_file(file.path)?;
        Ok(true)
      }
      None => Ok(false),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn layout() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let maildir = Maildir::open(directory.path())?;
    let root = directory.path().canonicalize()?;
    assert_eq!(Some(root.clone()), maildir.directory("INBOX"));
    assert_eq!(Some(root.clone()), maildir.directory("inbox"));
    assert_eq!(Some(root.join(".Sent")), maildir.directory("Sent"));
    // "Trash" in modified UTF-7 with a needlessly encoded letter.
    assert_eq!(Some(root.join(".Trash")), maildir.directory("Tras&AGg-"));
    for name in ["", ".", "..", "./Sent", "../Sent", "/", "&U,BTFw-", "folder/sub"] {
      assert_eq!(None, maildir.directory(name), "{name:?}");
    }
    assert!(root.join("cur").is_dir());
    assert!(root.join(".Trash/maildirfolder").is_file());
    assert!(!root.join("maildirfolder").exists());
    Ok(())
  }

  #[test]
  fn flags() {
    assert_eq!("FS", flags_to_letters("\\Seen \\Flagged $Junk"));
    assert_eq!("\\Flagged \\Seen", letters_to_flags("FS"));
    assert_eq!("", letters_to_flags(""));
    assert_eq!("RST", with_letter("RT", 'S'));
    assert_eq!("S", with_letter("S", 'S'));
    assert_eq!(Some((12, "S")), parse_name("12:2,S"));
    assert_eq!(None, parse_name("1690000000.M1P2.host"));
  }

  #[test]
  fn append_and_query() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let maildir = Maildir::open(directory.path())?;
    assert_eq!(1, maildir.append("INBOX", b"From: a\n\nfirst\n", "")?);
    assert_eq!(2, maildir.append("Sent", b"second", "\\Seen")?);
    assert_eq!(3, maildir.append("INBOX", b"third\r\n", "\\Flagged")?);
    assert!(maildir.append("Unknown", b"", "").is_err());

    assert_eq!(2, maildir.count("INBOX")?);
    assert_eq!(2, maildir.count_unseen("INBOX")?);
    assert_eq!(0, maildir.count_unseen("Sent")?);
    assert_eq!(0, maildir.count("Unknown")?);

    let entries = maildir.query("INBOX", &Window::Positions(2..=2))?;
    assert_eq!(1, entries.len());
    assert_eq!(2, entries[0].sequence);
    assert_eq!(3, entries[0].message.id);
    assert_eq!("\\Flagged", entries[0].message.flags);
    assert_eq!(b"third\r\n".to_vec(), entries[0].message.content);
    assert!(entries[0].message.internal_date.is_some());

    let entries = maildir.query("INBOX", &Window::Uids(1..=1))?;
    assert_eq!(b"From: a\r\n\r\nfirst\r\n".to_vec(), entries[0].message.content);
    Ok(())
  }

  #[test]
  fn mark_seen() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let maildir = Maildir::open(directory.path())?;
    maildir.append("INBOX", b"a", "\\Answered")?;
    maildir.append("INBOX", b"b", "")?;
    assert_eq!(2, maildir.mark_seen("INBOX", &Window::All)?);
    assert_eq!(0, maildir.mark_seen("INBOX", &Window::All)?);
    assert_eq!(0, maildir.count_unseen("INBOX")?);
    let root = directory.path().canonicalize()?;
    assert!(root.join("cur/1:2,RS").is_file());
    assert!(root.join("cur/2:2,S").is_file());
    Ok(())
  }

  #[test]
  fn adoption() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let root = directory.path().canonicalize()?;
    {
      let maildir = Maildir::open(&root)?;
      maildir.append("INBOX", b"a", "")?;
      assert!(maildir.expunge("INBOX", 1)?);
      assert!(!maildir.expunge("INBOX", 1)?);
    }
    // Delivered by someone else while the server was down.
    fs::write(root.join("new/1690000000.M1P2.host"), b"b")?;
    fs::write(root.join("cur/1690000001.M1P2.host:2,S"), b"c")?;

    let maildir = Maildir::open(&root)?;
    // UIDs aren't reused across restarts.
    let uids = maildir.uids("INBOX")?;
    assert_eq!(vec![2, 3], uids);
    assert_eq!(1, maildir.count_unseen("INBOX")?);
    assert_eq!(Some(3), maildir.last_uid("INBOX")?);
    assert_eq!("4", fs::read_to_string(root.join("uidnext"))?);
    Ok(())
  }

  #[test]
  fn delivery() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let root = directory.path().canonicalize()?;
    let maildir = Maildir::open(&root)?;
    maildir.append("INBOX", b"a", "")?;
    fs::write(root.join("new/1690000000.M1P2.host"), b"b")?;
    // Adopted once, the listing that follows the rename doesn't see it again.
    assert_eq!(2, maildir.count("INBOX")?);
    assert_eq!(2, maildir.count("INBOX")?);
    assert_eq!(vec![1, 2], maildir.uids("INBOX")?);
    assert!(root.join("cur/2:2,").is_file());
    assert_eq!(0, fs::read_dir(root.join("new"))?.count());
    Ok(())
  }

  #[test]
  fn foreign_folders() -> anyhow::Result<()> {
    let parent = tempfile::tempdir()?;
    let parent_root = parent.path().canonicalize()?;
    for subdirectory in ["cur", "new", "tmp"] {
      fs::create_dir_all(parent_root.join(subdirectory))?;
    }
    fs::write(parent_root.join("cur/1690000001.M1P2.host:2,"), b"outside")?;
    let maildir = Maildir::open(&parent_root.join(".Archive"))?;
    for name in ["..", ".", ""] {
      assert_eq!(0, maildir.count(name)?, "{name:?}");
      assert_eq!(0, maildir.mark_seen(name, &Window::Uids(1..=u64::MAX))?);
      assert!(maildir.append(name, b"", "").is_err());
    }
    assert!(parent_root.join("cur/1690000001.M1P2.host:2,").is_file());
    Ok(())
  }
}
