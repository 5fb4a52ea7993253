use std::{
  io::{self, BufRead as _, Read as _, Write as _},
  net, sync, thread, time,
};

const TIMEOUT: time::Duration = time::Duration::from_secs(10);

// A server accepting every credential, listening on localhost for as long as the test runs.
pub struct Server {
  pub port: u16,
  pub store: sync::Arc<dyn postern::store::Store>,
}

impl Server {
  pub fn start(store: sync::Arc<dyn postern::store::Store>, idle_interval: time::Duration) -> Self {
    let port = portpicker::pick_unused_port().unwrap();
    // Bound before returning: connections are queued until the thread accepts them.
    let listener = net::TcpListener::bind(("127.0.0.1", port)).unwrap();
    let server = postern::Server::new(postern::Context {
      store: store.clone(),
      authenticator: sync::Arc::new(postern::auth::AcceptAll),
      tls: None,
      timeout: Some(TIMEOUT),
      idle_interval,
    });
    thread::spawn(move || server.serve(listener, false));
    Self { port, store }
  }

  // The in-memory store with the sample messages.
  pub fn seeded() -> Self {
    let store = sync::Arc::new(postern::store::Memory::new());
    postern::store::seed(store.as_ref()).unwrap();
    Self::start(store, time::Duration::from_millis(100))
  }

  pub fn connect(&self) -> Client {
    let stream = net::TcpStream::connect(("127.0.0.1", self.port)).unwrap();
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    let mut client = Client {
      reader: io::BufReader::new(stream.try_clone().unwrap()),
      writer: stream,
    };
    let greeting = client.line();
    assert!(greeting.starts_with("* OK [CAPABILITY "), "{greeting}");
    client
  }
}

pub struct Client {
  reader: io::BufReader<net::TcpStream>,
  writer: net::TcpStream,
}

impl Client {
  pub fn send(&mut self, line: &str) {
    log::debug!("sending {line}");
    self.writer.write_all(format!("{line}\r\n").as_bytes()).unwrap();
  }

  // Including the CRLF.
  pub fn line(&mut self) -> String {
    let mut line = String::new();
    self.reader.read_line(&mut line).unwrap();
    line
  }

  pub fn bytes(&mut self, length: usize) -> Vec<u8> {
    let mut bytes = vec![0; length];
    self.reader.read_exact(&mut bytes).unwrap();
    bytes
  }

  // Every line up to and including the tagged response.
  pub fn until(&mut self, tag: &str) -> String {
    let mut lines = String::new();
    loop {
      let line = self.line();
      assert!(!line.is_empty(), "connection closed before {tag} completed");
      lines += &line;
      if line.starts_with(&format!("{tag} ")) {
        return lines;
      }
    }
  }

  // Sends a command and waits for its completion.
  pub fn command(&mut self, tag: &str, command: &str) -> String {
    self.send(&format!("{tag} {command}"));
    self.until(tag)
  }

  // Whether the server closed the connection without saying anything else.
  pub fn closed(&mut self) -> bool {
    let mut rest = String::new();
    match self.reader.read_line(&mut rest) {
      Ok(length) => length == 0,
      // Writing to a closed connection may get it reset.
      Err(error) => error.kind() == io::ErrorKind::ConnectionReset,
    }
  }
}
