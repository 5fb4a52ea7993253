// https://www.rfc-editor.org/rfc/rfc2177
//
// While idling, the store is watched for changes to the selected mailbox (waking up as soon as it
// notifies one, or every interval for stores that can't) and the client for DONE.

use super::{Outcome, Session};
use crate::imap;
use std::time;

// How long the client is given to say DONE between two rounds.
const POLL: time::Duration = time::Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq)]
struct Snapshot {
  exists: u64,
  unseen: u64,
}

// The untagged updates turning one snapshot into the next.
fn updates(before: Snapshot, after: Snapshot) -> Vec<String> {
  let mut updates = Vec::new();
  if after.exists > before.exists {
    updates.push(format!("{} EXISTS", after.exists));
    updates.push(format!("{} RECENT", after.exists - before.exists));
  } else {
    // https://www.rfc-editor.org/rfc/rfc3501#section-7.4.1
    // [...] the sequence number for each successive message in the mailbox is immediately
    // decremented by 1 [...] so expunging from the highest number keeps them all valid.
    for sequence in (after.exists + 1..=before.exists).rev() {
      updates.push(format!("{sequence} EXPUNGE"));
    }
  }
  if after.unseen != before.unseen {
    updates.push(format!(
      "OK [UNSEEN {}] Message {} is first unseen",
      after.unseen, after.unseen
    ));
  }
  updates
}

impl<T> Session<'_, T>
where
  T: imap::Transport,
{
  // None when the store couldn't be queried, the previous snapshot then stands.
  fn snapshot(&self, mailbox: &str) -> Option<Snapshot> {
    let store = &self.context.store;
    match (store.count(mailbox), store.count_unseen(mailbox)) {
      (Ok(exists), Ok(unseen)) => Some(Snapshot { exists, unseen }),
      (Err(error), _) | (_, Err(error)) => {
        log::warn!("couldn't refresh {mailbox} while idling: {error:#}");
        None
      }
    }
  }

  pub(super) fn idle(&mut self) -> Outcome {
    let (mailbox, _) = self.require_selected()?;
    let store = self.context.store.clone();
    // Taken first so that changes racing with the snapshot are still noticed.
    let mut generation = store.generation();
    let mut snapshot = self.snapshot(&mailbox).unwrap_or(Snapshot {
      exists: 0,
      unseen: 0,
    });
    self.stream.continuation("idling")?;

    loop {
      store.wait(generation, self.context.idle_interval);
      generation = store.generation();
      if let Some(current) = self.snapshot(&mailbox) {
        for update in updates(snapshot, current) {
          self.stream.untagged(&update)?;
        }
        snapshot = current;
      }

      if let Some(line) = self.stream.poll_line(POLL)? {
        log::debug!("< {}", imap::escape(&line));
        if String::from_utf8_lossy(&line)
          .trim()
          .eq_ignore_ascii_case("DONE")
        {
          return Ok("IDLE terminated".to_string());
        }
      }
    }
  }
}
