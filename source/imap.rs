// https://www.rfc-editor.org/rfc/rfc3501 - IMAP4rev1
// https://www.rfc-editor.org/rfc/rfc2177 - IMAP4 IDLE command
//
// Commands are tokenized on whitespace only: no quoted strings, no literals, no parenthesized
// lists. The few arguments that carry structure (sequence sets, FETCH items, STORE flags) go
// through the grammar below once they've been isolated.

use base64::Engine as _;
use std::{cmp, fmt, io, net, ops, time};

pub trait Transport: io::Read + io::Write {
  fn set_read_timeout(&self, timeout: Option<time::Duration>) -> io::Result<()>;
}

impl Transport for net::TcpStream {
  fn set_read_timeout(&self, timeout: Option<time::Duration>) -> io::Result<()> {
    net::TcpStream::set_read_timeout(self, timeout)
  }
}

#[derive(Debug, PartialEq)]
pub struct Command<'input> {
  pub tag: &'input str,
  pub verb: String,
  pub arguments: Vec<&'input str>,
}

impl<'input> Command<'input> {
  // None when the line doesn't even carry a tag and a verb.
  pub fn tokenize(line: &'input str) -> Option<Self> {
    let mut tokens = line.split_whitespace();
    let tag = tokens.next()?;
    let verb = tokens.next()?.to_ascii_uppercase();
    Some(Self {
      tag,
      verb,
      arguments: tokens.collect(),
    })
  }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Endpoint {
  Number(u64),
  Last,
}

// Inclusive, a single number n is Sequence(n, n).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sequence(pub Endpoint, pub Endpoint);

impl Sequence {
  pub fn parse(input: &str) -> anyhow::Result<Self> {
    parser::sequence(input)
      .map_err(|error| anyhow::anyhow!("invalid sequence {input:?}: {error}"))
  }

  // last is the message count when the endpoints are positions and the highest UID when they're
  // UIDs. A "*" endpoint on an empty mailbox gives an empty window (None), bounds still inverted
  // once "*" is resolved are an error except for the 1:* shorthand.
  pub fn resolve(&self, last: u64) -> anyhow::Result<Option<ops::RangeInclusive<u64>>> {
    Ok(match *self {
      Sequence(Endpoint::Number(start), Endpoint::Number(end)) => {
        anyhow::ensure!(start <= end, "inverted range {start}:{end}");
        Some(start..=end)
      }
      // https://www.rfc-editor.org/rfc/rfc3501#section-9
      // seq-number [...] "*" represents the largest number in use.
      Sequence(_, Endpoint::Number(end)) => Some(end..=end),
      Sequence(Endpoint::Number(start), Endpoint::Last) if start > last => {
        anyhow::ensure!(start == 1, "inverted range {start}:* with * = {last}");
        None
      }
      Sequence(Endpoint::Number(start), Endpoint::Last) => Some(start..=last),
      Sequence(Endpoint::Last, Endpoint::Last) if last == 0 => None,
      Sequence(Endpoint::Last, Endpoint::Last) => Some(last..=last),
    })
  }
}

#[derive(Debug, PartialEq)]
pub enum Item {
  Uid,
  Flags,
  InternalDate,
  Size,
  Header,
  HeaderFields(Vec<String>),
  Body,
}

// The set of requested FETCH data items: duplicates and ordering in the request are irrelevant,
// the response always lists them in the order of the fields below.
#[derive(Debug, Default, PartialEq)]
pub struct Items {
  pub uid: bool,
  pub flags: bool,
  pub internal_date: bool,
  pub size: bool,
  pub header: bool,
  pub header_fields: Option<Vec<String>>,
  pub body: bool,
}

impl Items {
  pub fn parse(input: &str) -> anyhow::Result<Self> {
    let mut items = Self::default();
    let parsed = parser::items(&input.to_ascii_uppercase())
      .map_err(|error| anyhow::anyhow!("invalid data items {input:?}: {error}"))?;
    for item in parsed {
      match item {
        Item::Uid => items.uid = true,
        Item::Flags => items.flags = true,
        Item::InternalDate => items.internal_date = true,
        Item::Size => items.size = true,
        Item::Header => items.header = true,
        Item::HeaderFields(fields) => {
          items.header_fields.get_or_insert(fields);
        }
        Item::Body => items.body = true,
      }
    }
    Ok(items)
  }

  pub fn is_empty(&self) -> bool {
    *self == Self::default()
  }
}

peg::parser! {
  // https://www.rfc-editor.org/rfc/rfc3501#section-9
  // Only the fragments needed once a command has been split on whitespace (and rejoined).
  pub grammar parser() for str {
    // DIGIT = %x30-39
    rule DIGIT() = ['0'..='9']
    // digit-nz = %x31-39
    rule digit_nz() = ['1'..='9']
    // nz-number = digit-nz *DIGIT
    rule nz_number() -> u64
      = n:$(digit_nz() DIGIT()*)
      {? n.parse().or(Err("nz-number")) }

    // seq-number = nz-number / "*"
    rule seq_number() -> Endpoint
      = n:nz_number() { Endpoint::Number(n) } / "*" { Endpoint::Last }
    // seq-range = seq-number ":" seq-number
    // Unlike the RFC, a single set is accepted (no "," between ranges) and the bounds aren't
    // swapped: 4:2 is rejected when resolved.
    pub rule sequence() -> Sequence
      = s:seq_number() e:(":" e:seq_number() { e })?
      { Sequence(s, e.unwrap_or(s)) }

    // Items may have been separated by commas by lenient clients.
    rule separator() = [' ' | ',']+
    rule atom_char() = !['(' | ')' | '[' | ']' | ' ' | ','] [_]
    rule atom() = (atom_char() / "[" (!"]" [_])* "]")+
    rule boundary() = !atom_char()

    // header-fld-name = astring
    rule header_fld_name() -> String
      = f:$(atom_char()+)
      { f.to_string() }
    // header-list = "(" header-fld-name *(SP header-fld-name) ")"
    rule header_list() -> Vec<String>
      = "(" separator()? fs:(header_fld_name() ** separator()) separator()? ")"
      { fs }
    rule body() = "BODY.PEEK" / "BODY"

    // fetch-att = "ENVELOPE" / "FLAGS" / "INTERNALDATE" / "RFC822" [".HEADER" / ".SIZE" / ".TEXT"] /
    //             "BODY" ["STRUCTURE"] / "UID" / "BODY" section ["<" number "." nz-number ">"] /
    //             "BODY.PEEK" section ["<" number "." nz-number ">"]
    // Unsupported attributes are skipped.
    rule fetch_att() -> Option<Item>
      = "RFC822.SIZE" boundary() { Some(Item::Size) }
      / "RFC822.HEADER" boundary() { Some(Item::Header) }
      / "RFC822" boundary() { Some(Item::Body) }
      / "UID" boundary() { Some(Item::Uid) }
      / "FLAGS" boundary() { Some(Item::Flags) }
      / "INTERNALDATE" boundary() { Some(Item::InternalDate) }
      / body() "[HEADER.FIELDS" separator() fs:header_list() "]" boundary() { Some(Item::HeaderFields(fs)) }
      / body() "[HEADER]" boundary() { Some(Item::Header) }
      / body() "[]" boundary() { Some(Item::Body) }
      / atom() { None }

    // Expects an upper-cased input.
    pub rule items() -> Vec<Item>
      = separator()? "("? separator()? is:(fetch_att() ** separator()) separator()? ")"? separator()?
      { is.into_iter().flatten().collect() }

    // flag-list = "(" [flag *(SP flag)] ")"
    pub rule flag_list() -> Vec<&'input str>
      = separator()? "("? separator()? fs:($(atom_char()+) ** separator()) separator()? ")"? separator()?
      { fs }
  }
}

// https://www.rfc-editor.org/rfc/rfc3501#section-5.1.3
// Mailbox names are in modified UTF-7: printable US-ASCII represents itself and "&...-" shifts to
// modified BASE64 encoded UTF-16BE ("&-" being "&").
pub fn decode_mailbox(name: &str) -> Option<String> {
  let engine = base64::engine::GeneralPurpose::new(
    &base64::alphabet::IMAP_MUTF7,
    base64::engine::general_purpose::NO_PAD,
  );
  if !name.bytes().all(|byte| (0x20..=0x7e).contains(&byte)) {
    return None;
  }
  let mut decoded = String::with_capacity(name.len());
  let mut rest = name;
  while let Some(shift) = rest.find('&') {
    decoded.push_str(&rest[..shift]);
    let encoded = &rest[shift + 1..];
    let end = encoded.find('-')?;
    if end == 0 {
      decoded.push('&');
    } else {
      let utf16 = engine.decode(&encoded[..end]).ok()?;
      let (utf8, malformed) = encoding_rs::UTF_16BE.decode_without_bom_handling(&utf16);
      if malformed {
        return None;
      }
      decoded.push_str(&utf8);
    }
    rest = &encoded[end + 1..];
  }
  decoded.push_str(rest);
  Some(decoded)
}

pub fn escape(bytes: &[u8]) -> String {
  bytes
    .iter()
    .flat_map(|byte| std::ascii::escape_default(*byte))
    .map(char::from)
    .collect()
}

// Only the first line of a response is worth logging, literals can be whole messages.
fn summarize(bytes: &[u8]) -> String {
  let stop = memchr::memmem::find(bytes, b"\r\n").unwrap_or(bytes.len());
  let stop = cmp::min(stop + 2 /* \r\n */, bytes.len());
  let mut string = escape(&bytes[..stop]);
  if stop < bytes.len() {
    string += "...omitted...";
  }
  string
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Status {
  Ok,
  No,
  Bad,
}

impl fmt::Display for Status {
  fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
    formatter.write_str(match self {
      Status::Ok => "OK",
      Status::No => "NO",
      Status::Bad => "BAD",
    })
  }
}

// https://www.rfc-editor.org/rfc/rfc7162#section-4
// [...] a server should allow [command lines] of up to 8192 octets.
// Be more generous since nothing here ever spans literals.
const MAXIMUM_LINE: usize = 64 * 1024;

#[derive(Debug)]
pub struct Stream<T> {
  transport: T,
  buffer: Vec<u8>,
  timeout: Option<time::Duration>,
}

impl<T> Stream<T>
where
  T: Transport,
{
  pub fn new(transport: T, timeout: Option<time::Duration>) -> io::Result<Self> {
    transport.set_read_timeout(timeout)?;
    Ok(Self {
      transport,
      buffer: Vec::new(),
      timeout,
    })
  }

  fn take_line(&mut self) -> Option<Vec<u8>> {
    let position = memchr::memchr(b'\n', &self.buffer)?;
    Some(self.buffer.drain(..=position).collect())
  }

  fn fill(&mut self) -> io::Result<usize> {
    let mut chunk = [0; 4096];
    let length = self.transport.read(&mut chunk)?;
    self.buffer.extend_from_slice(&chunk[..length]);
    Ok(length)
  }

  pub fn read_line(&mut self) -> anyhow::Result<Vec<u8>> {
    loop {
      if let Some(line) = self.take_line() {
        return Ok(line);
      }
      anyhow::ensure!(
        self.buffer.len() <= MAXIMUM_LINE,
        "command line longer than {MAXIMUM_LINE} bytes"
      );
      if self.fill()? == 0 {
        anyhow::bail!("end of stream");
      }
    }
  }

  // Waits at most for the given duration, the inactivity timeout is restored afterwards.
  pub fn poll_line(&mut self, wait: time::Duration) -> anyhow::Result<Option<Vec<u8>>> {
    if let Some(line) = self.take_line() {
      return Ok(Some(line));
    }
    self.transport.set_read_timeout(Some(wait))?;
    let result = self.fill();
    self.transport.set_read_timeout(self.timeout)?;
    match result {
      Ok(0) => anyhow::bail!("end of stream"),
      Ok(_) => Ok(self.take_line()),
      Err(error)
        if error.kind() == io::ErrorKind::WouldBlock || error.kind() == io::ErrorKind::TimedOut =>
      {
        Ok(None)
      }
      Err(error) => Err(error)?,
    }
  }

  pub fn write(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
    log::debug!("> {}", summarize(bytes));
    self.transport.write_all(bytes)?;
    self.transport.flush()?;
    Ok(())
  }

  pub fn untagged(&mut self, text: &str) -> anyhow::Result<()> {
    self.write(format!("* {text}\r\n").as_bytes())
  }

  pub fn tagged(&mut self, tag: &str, status: Status, text: &str) -> anyhow::Result<()> {
    self.write(format!("{tag} {status} {text}\r\n").as_bytes())
  }

  pub fn continuation(&mut self, text: &str) -> anyhow::Result<()> {
    self.write(format!("+ {text}\r\n").as_bytes())
  }

  // Anything the client pipelined is dropped: after STARTTLS it was sent in the clear.
  pub fn into_inner(self) -> T {
    if !self.buffer.is_empty() {
      log::warn!("discarding {} unread byte(s)", self.buffer.len());
    }
    self.transport
  }
}
