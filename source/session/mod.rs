// https://www.rfc-editor.org/rfc/rfc3501#section-3 - State and Flow Diagram
//
//   connection ──> not authenticated ──LOGIN──> authenticated ──SELECT/EXAMINE──> selected
//                                                                    (IDLE ⇄ DONE)
//
// LOGOUT ends the session from any state. STARTTLS ends it too: the caller takes the transport
// back, wraps it and starts a brand new session on top of it, so nothing survives the upgrade.

use crate::{imap, store, Context};
use std::fmt;
use zeroize::Zeroize as _;

mod fetch;
mod idle;

#[derive(Debug)]
pub enum Failure {
  // Malformed command or arguments.
  Bad(String),
  // Well formed but refused (state, store).
  No(String),
  // The connection can't be used anymore.
  Fatal(anyhow::Error),
}

impl fmt::Display for Failure {
  fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Failure::Bad(text) => write!(formatter, "BAD {text}"),
      Failure::No(text) => write!(formatter, "NO {text}"),
      Failure::Fatal(error) => write!(formatter, "{error:#}"),
    }
  }
}

impl From<anyhow::Error> for Failure {
  fn from(error: anyhow::Error) -> Self {
    Failure::Fatal(error)
  }
}

// The text of the tagged OK.
type Outcome = Result<String, Failure>;

fn database(error: anyhow::Error) -> Failure {
  log::warn!("store failure: {error:#}");
  Failure::No("Database error".to_string())
}

// Where counters are informational, a failing store reads as empty.
fn or_zero(result: anyhow::Result<u64>) -> u64 {
  result.unwrap_or_else(|error| {
    log::warn!("store failure, counting 0: {error:#}");
    0
  })
}

fn mailbox(argument: &str) -> String {
  let name = argument.trim_matches('"');
  // https://www.rfc-editor.org/rfc/rfc3501#section-5.1
  // The case-insensitive mailbox name INBOX is a special name reserved to mean "the primary
  // mailbox for this user on this server".
  if name.eq_ignore_ascii_case(store::INBOX) {
    return store::INBOX.to_string();
  }
  imap::decode_mailbox(name).unwrap_or_else(|| name.to_string())
}

#[derive(Clone, Debug, PartialEq)]
enum State {
  NotAuthenticated,
  Authenticated {
    user: String,
  },
  Selected {
    user: String,
    mailbox: String,
    read_only: bool,
  },
}

#[derive(Debug, PartialEq)]
pub enum Ending {
  Logout,
  StartTls,
}

pub struct Session<'context, T> {
  stream: imap::Stream<T>,
  context: &'context Context,
  tls: bool,
  state: State,
}

impl<'context, T> Session<'context, T>
where
  T: imap::Transport,
{
  pub fn new(context: &'context Context, transport: T, tls: bool) -> anyhow::Result<Self> {
    Ok(Self {
      stream: imap::Stream::new(transport, context.timeout)?,
      context,
      tls,
      state: State::NotAuthenticated,
    })
  }

  fn capabilities(&self) -> &'static str {
    if self.tls {
      "IMAP4rev1 IDLE"
    } else {
      "IMAP4rev1 STARTTLS IDLE"
    }
  }

  pub fn greet(&mut self) -> anyhow::Result<()> {
    let text = format!("OK [CAPABILITY {}] IMAP server ready", self.capabilities());
    self.stream.untagged(&text)
  }

  // Only returns Ok on a graceful ending, I/O errors (including the inactivity timeout and the
  // client going away) are errors.
  pub fn run(&mut self) -> anyhow::Result<Ending> {
    loop {
      let mut line = self.stream.read_line()?;
      let ending = self.line(&line);
      // It may hold a LOGIN password.
      line.zeroize();
      if let Some(ending) = ending? {
        return Ok(ending);
      }
    }
  }

  pub fn into_transport(self) -> T {
    self.stream.into_inner()
  }

  fn line(&mut self, line: &[u8]) -> anyhow::Result<Option<Ending>> {
    let line = String::from_utf8_lossy(line);
    let Some(command) = imap::Command::tokenize(&line) else {
      if !line.trim().is_empty() {
        log::debug!("< {}", imap::escape(line.as_bytes()));
        self.stream.untagged("BAD Invalid command format")?;
      }
      return Ok(None);
    };
    if command.verb == "LOGIN" {
      log::debug!("< {} LOGIN <redacted>", command.tag);
    } else {
      log::debug!("< {}", imap::escape(line.as_bytes()));
    }

    let tag = command.tag;
    let arguments = command.arguments.as_slice();
    let outcome = match command.verb.as_str() {
      "CAPABILITY" => self.capability(),
      "LOGIN" => self.login(arguments),
      "LOGOUT" => {
        self.stream.untagged("BYE IMAP server logging out")?;
        self.stream.tagged(tag, imap::Status::Ok, "LOGOUT completed")?;
        return Ok(Some(Ending::Logout));
      }
      "STARTTLS" if self.tls => Err(Failure::Bad("TLS already active".to_string())),
      "STARTTLS" => {
        self
          .stream
          .tagged(tag, imap::Status::Ok, "Begin TLS negotiation")?;
        return Ok(Some(Ending::StartTls));
      }
      "NOOP" => Ok("NOOP completed".to_string()),
      "LIST" => self.list(),
      "SELECT" => self.select(arguments, false),
      "EXAMINE" => self.select(arguments, true),
      "STATUS" => self.status(arguments),
      "SEARCH" => self.search(false),
      "FETCH" => self.fetch(arguments, false),
      "STORE" => self.store(arguments, false),
      "IDLE" => self.idle(),
      "UID" => self.uid(arguments),
      verb => Err(Failure::Bad(format!("Unknown command: {verb}"))),
    };

    match outcome {
      Ok(text) => self.stream.tagged(tag, imap::Status::Ok, &text)?,
      Err(Failure::Bad(text)) => self.stream.tagged(tag, imap::Status::Bad, &text)?,
      Err(Failure::No(text)) => self.stream.tagged(tag, imap::Status::No, &text)?,
      Err(Failure::Fatal(error)) => Err(error)?,
    }
    Ok(None)
  }

  fn require_authenticated(&self) -> Result<String, Failure> {
    match &self.state {
      State::NotAuthenticated => Err(Failure::No("Please authenticate first".to_string())),
      State::Authenticated { user } | State::Selected { user, .. } => Ok(user.clone()),
    }
  }

  // The selected mailbox and whether it was opened read-only.
  fn require_selected(&self) -> Result<(String, bool), Failure> {
    match &self.state {
      State::NotAuthenticated => Err(Failure::No("Please authenticate first".to_string())),
      State::Authenticated { .. } => Err(Failure::No("No folder selected".to_string())),
      State::Selected {
        mailbox, read_only, ..
      } => Ok((mailbox.clone(), *read_only)),
    }
  }

  fn capability(&mut self) -> Outcome {
    let text = format!("CAPABILITY {}", self.capabilities());
    self.stream.untagged(&text)?;
    Ok("CAPABILITY completed".to_string())
  }

  fn login(&mut self, arguments: &[&str]) -> Outcome {
    let [user, password, ..] = arguments else {
      return Err(Failure::Bad(
        "LOGIN requires username and password".to_string(),
      ));
    };
    let user = user.trim_matches('"');
    let mut password = password.trim_matches('"').to_string();
    let result = self.context.authenticator.authenticate(user, &password);
    password.zeroize();
    match result {
      Ok(true) => {
        log::info!("{user} authenticated");
        // A selection made under a previous LOGIN is kept.
        self.state = match &self.state {
          State::Selected {
            mailbox, read_only, ..
          } => State::Selected {
            user: user.to_string(),
            mailbox: mailbox.clone(),
            read_only: *read_only,
          },
          State::NotAuthenticated | State::Authenticated { .. } => State::Authenticated {
            user: user.to_string(),
          },
        };
        Ok("LOGIN completed".to_string())
      }
      Ok(false) => {
        log::info!("{user} failed to authenticate");
        Err(Failure::Bad("LOGIN authentication failed".to_string()))
      }
      Err(error) => {
        log::warn!("couldn't authenticate {user}: {error:#}");
        Err(Failure::Bad("LOGIN unable to reach auth server".to_string()))
      }
    }
  }

  fn list(&mut self) -> Outcome {
    self.require_authenticated()?;
    for folder in self.context.store.folders().map_err(database)? {
      let attributes = if folder.attributes.is_empty() {
        "\\Unmarked".to_string()
      } else {
        folder.attributes.join(" ")
      };
      self
        .stream
        .untagged(&format!("LIST ({attributes}) \"/\" \"{}\"", folder.name))?;
    }
    Ok("LIST completed".to_string())
  }

  fn select(&mut self, arguments: &[&str], read_only: bool) -> Outcome {
    let user = self.require_authenticated()?;
    let verb = if read_only { "EXAMINE" } else { "SELECT" };
    let [name, ..] = arguments else {
      return Err(Failure::Bad(format!("{verb} requires folder name")));
    };
    let mailbox = mailbox(name);
    let exists = or_zero(self.context.store.count(&mailbox));
    let recent = or_zero(self.context.store.count_unseen(&mailbox));
    self.state = State::Selected {
      user,
      mailbox,
      read_only,
    };

    for line in [
      format!("{exists} EXISTS"),
      format!("{recent} RECENT"),
      "OK [UIDVALIDITY 1] UID validity status".to_string(),
      format!("OK [UIDNEXT {}] Predicted next UID", exists + 1),
      "FLAGS (\\Answered \\Flagged \\Deleted \\Seen \\Draft)".to_string(),
      "OK [PERMANENTFLAGS (\\Answered \\Flagged \\Deleted \\Seen \\Draft \\*)] Flags permitted"
        .to_string(),
    ] {
      self.stream.untagged(&line)?;
    }
    Ok(if read_only {
      "[READ-ONLY] EXAMINE completed".to_string()
    } else {
      "[READ-WRITE] SELECT completed".to_string()
    })
  }

  // Only MESSAGES is computed, whatever the requested items.
  fn status(&mut self, arguments: &[&str]) -> Outcome {
    self.require_authenticated()?;
    let [name, _, ..] = arguments else {
      return Err(Failure::Bad("STATUS requires folder and items".to_string()));
    };
    let messages = or_zero(self.context.store.count(&mailbox(name)));
    // Echoed as the client wrote it, the decoded name may not be ASCII.
    let name = name.trim_matches('"');
    self.stream.untagged(&format!(
      "STATUS \"{name}\" (MESSAGES {messages} RECENT 0 UIDNEXT {} UIDVALIDITY 1 UNSEEN 0)",
      messages + 1
    ))?;
    Ok("STATUS completed".to_string())
  }

  // Criteria aren't evaluated: every message matches.
  fn search(&mut self, uid: bool) -> Outcome {
    let (mailbox, _) = self.require_selected()?;
    let failed = |error: anyhow::Error| {
      log::warn!("couldn't search {mailbox}: {error:#}");
      Failure::No("Search failed".to_string())
    };
    let numbers: Vec<u64> = if uid {
      self.context.store.uids(&mailbox).map_err(failed)?
    } else {
      (1..=self.context.store.count(&mailbox).map_err(failed)?).collect()
    };
    let mut text = "SEARCH".to_string();
    for number in numbers {
      text += &format!(" {number}");
    }
    self.stream.untagged(&text)?;
    Ok(if uid { "UID SEARCH completed" } else { "SEARCH completed" }.to_string())
  }

  fn uid(&mut self, arguments: &[&str]) -> Outcome {
    let [command, arguments @ ..] = arguments else {
      return Err(Failure::Bad("UID requires sub-command".to_string()));
    };
    match command.to_ascii_uppercase().as_str() {
      "FETCH" => self.fetch(arguments, true),
      "SEARCH" => self.search(true),
      "STORE" => self.store(arguments, true),
      command => Err(Failure::Bad(format!("Unknown UID command: {command}"))),
    }
  }
}
