use super::{database, Failure, Outcome, Session};
use crate::{imap, store};

// Used when BODY[HEADER.FIELDS ()] doesn't name any field.
const DEFAULT_FIELDS: &[&str] = &[
  "FROM",
  "TO",
  "CC",
  "BCC",
  "SUBJECT",
  "DATE",
  "MESSAGE-ID",
  "PRIORITY",
  "X-PRIORITY",
  "REFERENCES",
  "NEWSGROUPS",
  "IN-REPLY-TO",
  "CONTENT-TYPE",
  "REPLY-TO",
];

// https://www.rfc-editor.org/rfc/rfc3501#section-9
// date-time = DQUOTE date-day-fixed "-" date-month "-" date-year SP time SP zone DQUOTE
const INTERNAL_DATE: &str = "%d-%b-%Y %H:%M:%S %z";

fn invalid_sequence(error: anyhow::Error) -> Failure {
  log::debug!("{error:#}");
  Failure::Bad("Invalid sequence number".to_string())
}

// Up to and including the empty line separating the header from the body.
fn header(content: &[u8]) -> &[u8] {
  match memchr::memmem::find(content, b"\r\n\r\n") {
    Some(position) => &content[..position + 4],
    None => content,
  }
}

// Matching lines in the requested order (the last occurrence wins), then an empty line.
fn header_fields(content: &[u8], fields: &[String]) -> Vec<u8> {
  let lines: Vec<&[u8]> = header(content)
    .split(|byte| *byte == b'\n')
    .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
    .collect();
  let mut output = Vec::new();
  for field in fields {
    let prefix = format!("{field}:");
    let found = lines.iter().rev().find(|line| {
      line.len() >= prefix.len() && line[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
    });
    if let Some(line) = found {
      output.extend_from_slice(line);
      output.extend_from_slice(b"\r\n");
    }
  }
  output.extend_from_slice(b"\r\n");
  output
}

fn literal(name: &str, bytes: &[u8]) -> Vec<u8> {
  let mut output = format!("{name} {{{}}}\r\n", bytes.len()).into_bytes();
  output.extend_from_slice(bytes);
  output
}

// One untagged FETCH response, items in a fixed order whatever the request's.
fn render(entry: &store::Entry, items: &imap::Items) -> Vec<u8> {
  let message = &entry.message;
  let mut fields: Vec<Vec<u8>> = Vec::new();
  if items.uid {
    fields.push(format!("UID {}", message.id).into_bytes());
  }
  if items.flags {
    let flags = message.flags.split_whitespace().collect::<Vec<_>>().join(" ");
    fields.push(format!("FLAGS ({flags})").into_bytes());
  }
  if items.internal_date {
    let date = match message.internal_date {
      Some(date) => date.format(INTERNAL_DATE).to_string(),
      None => "01-Jan-1970 00:00:00 +0000".to_string(),
    };
    fields.push(format!("INTERNALDATE \"{date}\"").into_bytes());
  }
  if items.size {
    fields.push(format!("RFC822.SIZE {}", message.content.len()).into_bytes());
  }
  if items.header {
    fields.push(literal("BODY[HEADER]", header(&message.content)));
  }
  if let Some(requested) = &items.header_fields {
    let names: Vec<String> = if requested.is_empty() {
      DEFAULT_FIELDS.iter().map(|field| field.to_string()).collect()
    } else {
      requested.clone()
    };
    fields.push(literal(
      &format!("BODY[HEADER.FIELDS ({})]", names.join(" ")),
      &header_fields(&message.content, &names),
    ));
  }
  if items.body {
    fields.push(literal("BODY[]", &message.content));
  }
  if items.is_empty() {
    fields.push(b"FLAGS ()".to_vec());
  }

  let mut output = format!("* {} FETCH (", entry.sequence).into_bytes();
  output.extend_from_slice(&fields.join(&b' '));
  output.extend_from_slice(b")\r\n");
  output
}

impl<T> Session<'_, T>
where
  T: imap::Transport,
{
  // None when the window can't contain anything. The store is only asked for the current maximum
  // when the sequence ends with "*".
  fn window(
    &self,
    mailbox: &str,
    sequence: imap::Sequence,
    uid: bool,
  ) -> Result<Option<store::Window>, Failure> {
    // 1:* and a bare "*" stand for every message, unless they're UIDs.
    if let imap::Sequence(imap::Endpoint::Number(1) | imap::Endpoint::Last, imap::Endpoint::Last) =
      sequence
    {
      if !uid {
        return Ok(Some(store::Window::All));
      }
    }
    let last = match sequence {
      imap::Sequence(_, imap::Endpoint::Last) if uid => self
        .context
        .store
        .last_uid(mailbox)
        .map_err(database)?
        .unwrap_or(0),
      imap::Sequence(_, imap::Endpoint::Last) => {
        self.context.store.count(mailbox).map_err(database)?
      }
      imap::Sequence(_, imap::Endpoint::Number(_)) => 0,
    };
    Ok(sequence.resolve(last).map_err(invalid_sequence)?.map(|range| {
      if uid {
        store::Window::Uids(range)
      } else {
        store::Window::Positions(range)
      }
    }))
  }

  pub(super) fn fetch(&mut self, arguments: &[&str], uid: bool) -> Outcome {
    let (mailbox, _) = self.require_selected()?;
    let command = if uid { "UID FETCH" } else { "FETCH" };
    let [sequence, items @ ..] = arguments else {
      return Err(Failure::Bad(format!("{command} requires sequence and items")));
    };
    if items.is_empty() {
      return Err(Failure::Bad(format!("{command} requires sequence and items")));
    }
    let sequence = imap::Sequence::parse(sequence).map_err(invalid_sequence)?;
    let mut items = imap::Items::parse(&items.join(" ")).map_err(|error| {
      log::debug!("{error:#}");
      Failure::Bad(format!("{command} invalid data items"))
    })?;
    // https://www.rfc-editor.org/rfc/rfc3501#section-6.4.8
    // UID FETCH [...] the UID data item MUST be included in each FETCH response.
    items.uid |= uid;

    if let Some(window) = self.window(&mailbox, sequence, uid)? {
      for entry in self
        .context
        .store
        .query(&mailbox, &window)
        .map_err(database)?
      {
        self.stream.write(&render(&entry, &items))?;
      }
    }
    Ok(format!("{command} completed"))
  }

  // Only adding \Seen is possible, which is idempotent.
  pub(super) fn store(&mut self, arguments: &[&str], uid: bool) -> Outcome {
    let (mailbox, read_only) = self.require_selected()?;
    let command = if uid { "UID STORE" } else { "STORE" };
    let [sequence, operation, flags @ ..] = arguments else {
      return Err(Failure::Bad(format!(
        "{command} requires sequence, operation, and flags"
      )));
    };
    if flags.is_empty() {
      return Err(Failure::Bad(format!(
        "{command} requires sequence, operation, and flags"
      )));
    }
    let sequence = imap::Sequence::parse(sequence).map_err(invalid_sequence)?;
    match operation.to_ascii_uppercase().as_str() {
      "FLAGS" | "+FLAGS" | "FLAGS.SILENT" | "+FLAGS.SILENT" => (),
      _ => return Err(Failure::Bad(format!("{command} unsupported operation {operation}"))),
    }
    let flags = flags.join(" ");
    match imap::parser::flag_list(&flags).as_deref() {
      Ok([flag]) if flag.eq_ignore_ascii_case(store::SEEN) => (),
      Ok(_) | Err(_) => return Err(Failure::Bad("Only \\Seen flag supported".to_string())),
    }
    if read_only {
      return Err(Failure::No(format!("{command} not permitted, mailbox is read-only")));
    }

    if let Some(window) = self.window(&mailbox, sequence, uid)? {
      let changed = self
        .context
        .store
        .mark_seen(&mailbox, &window)
        .map_err(database)?;
      log::debug!("marked {changed} message(s) as seen in {mailbox}");
    }
    // UID STORE too.
    Ok("STORE completed".to_string())
  }
}
