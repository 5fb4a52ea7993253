use postern::store::{self, Store as _};
use pretty_assertions::assert_eq;
use std::{fs, sync, time};
use test_log::test;

mod common;

// Changes are made once the client knows the server is idling, every update is then expected in
// order before the next change.
fn watch(server: &common::Server) {
  let mut client = server.connect();
  client.command("a1", "LOGIN bob pw");
  client.command("a2", "SELECT INBOX");
  client.send("a3 IDLE");
  assert_eq!("+ idling\r\n", client.line());

  let uid = server
    .store
    .append(store::INBOX, b"Subject: new\r\n\r\nhello\r\n", "")
    .unwrap();
  assert_eq!("* 3 EXISTS\r\n", client.line());
  assert_eq!("* 1 RECENT\r\n", client.line());
  assert_eq!("* OK [UNSEEN 3] Message 3 is first unseen\r\n", client.line());

  assert!(server.store.expunge(store::INBOX, 1).unwrap());
  assert_eq!("* 3 EXPUNGE\r\n", client.line());
  assert_eq!("* OK [UNSEEN 2] Message 2 is first unseen\r\n", client.line());

  assert!(server.store.expunge(store::INBOX, uid).unwrap());
  server.store.expunge(store::INBOX, 2).unwrap();
  // Both removals may be noticed together or one at a time.
  let mut updates = String::new();
  while !(updates.contains("* 1 EXPUNGE\r\n")
    && updates.contains("* OK [UNSEEN 0] Message 0 is first unseen\r\n"))
  {
    updates += &client.line();
  }
  assert!(updates.starts_with("* 2 EXPUNGE\r\n"), "{updates}");

  client.send("done");
  assert_eq!("a3 OK IDLE terminated\r\n", client.line());
  assert_eq!("* SEARCH\r\na4 OK SEARCH completed\r\n", client.command("a4", "SEARCH ALL"));
}

#[test]
fn memory() {
  watch(&common::Server::seeded());
}

#[test]
fn maildir() {
  let directory = tempfile::tempdir().unwrap();
  let maildir = store::Maildir::open(directory.path()).unwrap();
  store::seed(&maildir).unwrap();
  watch(&common::Server::start(
    sync::Arc::new(maildir),
    time::Duration::from_millis(100),
  ));
}

#[test]
fn maildir_delivery() {
  let directory = tempfile::tempdir().unwrap();
  let maildir = store::Maildir::open(directory.path()).unwrap();
  store::seed(&maildir).unwrap();
  let server = common::Server::start(sync::Arc::new(maildir), time::Duration::from_millis(100));
  let mut client = server.connect();
  client.command("a1", "LOGIN bob pw");
  client.command("a2", "SELECT INBOX");
  client.send("a3 IDLE");
  assert_eq!("+ idling\r\n", client.line());

  // Delivered the way an MDA does it, written in tmp/ then moved to new/.
  let tmp = directory.path().join("tmp/1690000000.M1P2.host");
  fs::write(&tmp, b"Subject: delivered\r\n\r\nhello\r\n").unwrap();
  fs::rename(&tmp, directory.path().join("new/1690000000.M1P2.host")).unwrap();
  assert_eq!("* 3 EXISTS\r\n", client.line());
  assert_eq!("* 1 RECENT\r\n", client.line());
  assert_eq!("* OK [UNSEEN 3] Message 3 is first unseen\r\n", client.line());

  client.send("DONE");
  assert_eq!("a3 OK IDLE terminated\r\n", client.line());
  assert_eq!(
    "* SEARCH 1 2 3\r\na4 OK SEARCH completed\r\n",
    client.command("a4", "SEARCH ALL")
  );
}

#[test]
fn done_without_changes() {
  let server = common::Server::seeded();
  let mut client = server.connect();
  client.command("a1", "LOGIN bob pw");
  assert_eq!("a2 NO No folder selected\r\n", client.command("a2", "IDLE"));
  client.command("a3", "SELECT INBOX");
  client.send("a4 IDLE");
  assert_eq!("+ idling\r\n", client.line());
  client.send("DONE");
  assert_eq!("a4 OK IDLE terminated\r\n", client.line());
}
