// https://www.rfc-editor.org/rfc/rfc3501 - IMAP4rev1
// https://www.rfc-editor.org/rfc/rfc2177 - IMAP4 IDLE command
// https://www.rfc-editor.org/rfc/rfc2595 - Using TLS with IMAP, POP3 and ACAP

use anyhow::Context as _;
use std::{net, num, path, sync, thread, time};

pub mod auth;
mod imap;
mod session;
pub mod store;
mod tls;

#[derive(Clone, Debug, PartialEq, clap::ValueEnum)]
pub enum Authentication {
  AcceptAll,
  Remote,
}

fn parse_duration(argument: &str) -> Result<time::Duration, num::ParseIntError> {
  Ok(time::Duration::from_secs(argument.parse()?))
}

#[derive(clap::Args)]
#[group(skip)]
pub struct Arguments {
  #[arg(long = "address", help = "Listening address", default_value_t = String::from("0.0.0.0"))]
  pub address: String,
  #[arg(long = "port", help = "Plaintext (STARTTLS capable) port", default_value_t = 143)]
  pub port: u16,
  #[arg(long = "tls-port", help = "Implicit TLS port")]
  pub tls_port: Option<u16>,
  #[arg(long = "certificate", help = "PEM certificate chain")]
  pub certificate: Option<path::PathBuf>,
  #[arg(long = "key", help = "PEM private key")]
  pub key: Option<path::PathBuf>,
  #[arg(long = "timeout", help = "Inactivity timeout (in seconds, 0 to disable)", default_value = "1800", value_parser = parse_duration)]
  pub timeout: time::Duration,
  #[arg(long = "idle-interval", help = "IDLE refresh interval (in seconds)", default_value = "2", value_parser = parse_duration)]
  pub idle_interval: time::Duration,

  #[arg(
    long = "authenticator",
    help = "Authentication strategy: accept-all | remote",
    default_value = "accept-all",
    hide_possible_values(true)
  )]
  pub authenticator: Authentication,
  #[arg(
    long = "authentication-url",
    help = "Remote authentication endpoint",
    default_value_t = String::from("https://thunder-server:8090/users/authenticate")
  )]
  pub authentication_url: String,
  #[arg(
    long = "domain",
    help = "Domain appended to users without one",
    default_value_t = String::from("openmail.lk")
  )]
  pub domain: String,
  #[arg(
    long = "verify-authentication-certificate",
    help = "Verify the certificate of the remote authentication endpoint",
    default_value_t = false
  )]
  pub verify_authentication_certificate: bool,

  #[arg(long = "maildir", help = "Maildir++ directory (messages are kept in memory otherwise)")]
  pub maildir: Option<path::PathBuf>,
  #[arg(
    long = "seed",
    help = "Insert sample messages into an empty store",
    default_value_t = true,
    action = clap::ArgAction::Set
  )]
  pub seed: bool,
}

// Everything a session needs, shared by all of them.
pub struct Context {
  pub store: sync::Arc<dyn store::Store>,
  pub authenticator: sync::Arc<dyn auth::Authenticator>,
  // None leaves STARTTLS advertised but unusable.
  pub tls: Option<sync::Arc<rustls::ServerConfig>>,
  pub timeout: Option<time::Duration>,
  pub idle_interval: time::Duration,
}

fn encrypted<T>(
  context: &Context,
  config: sync::Arc<rustls::ServerConfig>,
  transport: T,
  greet: bool,
) -> anyhow::Result<()>
where
  T: imap::Transport,
{
  let mut session = session::Session::new(context, tls::accept(config, transport)?, true)?;
  if greet {
    session.greet()?;
  }
  match session.run()? {
    session::Ending::Logout => Ok(()),
    session::Ending::StartTls => anyhow::bail!("STARTTLS over TLS"),
  }
}

fn connection(
  context: &Context,
  stream: net::TcpStream,
  implicit_tls: bool,
) -> anyhow::Result<()> {
  if implicit_tls {
    let config = context.tls.clone().context("TLS isn't configured")?;
    return encrypted(context, config, stream, true);
  }

  let mut session = session::Session::new(context, stream, false)?;
  session.greet()?;
  match session.run()? {
    session::Ending::Logout => Ok(()),
    session::Ending::StartTls => {
      let stream = session.into_transport();
      match context.tls.clone() {
        // No greeting: the client goes on with the next command.
        Some(config) => encrypted(context, config, stream, false),
        None => {
          log::error!("STARTTLS accepted without a certificate, abandoning the connection");
          Ok(())
        }
      }
    }
  }
}

pub struct Server {
  context: sync::Arc<Context>,
}

impl Server {
  pub fn new(context: Context) -> Self {
    Self {
      context: sync::Arc::new(context),
    }
  }

  // Accepts forever, one thread per connection.
  pub fn serve(&self, listener: net::TcpListener, implicit_tls: bool) -> anyhow::Result<()> {
    log::info!(
      "listening on {}{}",
      listener.local_addr()?,
      if implicit_tls { " (TLS)" } else { "" }
    );
    for stream in listener.incoming() {
      let stream = match stream {
        Ok(stream) => stream,
        Err(error) => {
          log::warn!("couldn't accept connection: {error}");
          continue;
        }
      };
      let peer = stream
        .peer_addr()
        .map(|address| address.to_string())
        .unwrap_or_else(|_| "unknown peer".to_string());
      let context = self.context.clone();
      let spawned = thread::Builder::new()
        .name(format!("connection {peer}"))
        .spawn(move || {
          log::info!("accepted connection from {peer}");
          match connection(&context, stream, implicit_tls) {
            Ok(()) => log::info!("closed connection from {peer}"),
            Err(error) => log::debug!("connection from {peer} ended: {error:#}"),
          }
        });
      if let Err(error) = spawned {
        log::error!("couldn't spawn connection thread: {error}");
      }
    }
    Ok(())
  }
}

fn bind(address: &str, port: u16) -> anyhow::Result<net::TcpListener> {
  net::TcpListener::bind((address, port)).with_context(|| format!("couldn't bind {address}:{port}"))
}

pub fn run(arguments: &Arguments) -> anyhow::Result<()> {
  let store: sync::Arc<dyn store::Store> = match &arguments.maildir {
    Some(maildir) => sync::Arc::new(store::Maildir::open(maildir)?),
    None => sync::Arc::new(store::Memory::new()),
  };
  if arguments.seed {
    store::seed(store.as_ref())?;
  }

  let authenticator: sync::Arc<dyn auth::Authenticator> = match arguments.authenticator {
    Authentication::AcceptAll => {
      log::warn!("every credential will be accepted");
      sync::Arc::new(auth::AcceptAll)
    }
    Authentication::Remote => sync::Arc::new(auth::Remote::new(
      &arguments.authentication_url,
      &arguments.domain,
      arguments.verify_authentication_certificate,
    )?),
  };

  let tls = match (&arguments.certificate, &arguments.key) {
    (Some(certificate), Some(key)) => match tls::server_config(certificate, key) {
      Ok(config) => Some(config),
      Err(error) => {
        log::error!("couldn't load the certificate, STARTTLS won't work: {error:#}");
        None
      }
    },
    (None, None) => None,
    (Some(_), None) | (None, Some(_)) => anyhow::bail!("--certificate and --key go together"),
  };
  anyhow::ensure!(
    arguments.tls_port.is_none() || tls.is_some(),
    "--tls-port requires a usable certificate and key"
  );

  let plaintext = bind(&arguments.address, arguments.port)?;
  let implicit = match arguments.tls_port {
    Some(port) => Some(bind(&arguments.address, port)?),
    None => None,
  };
  let server = Server::new(Context {
    store,
    authenticator,
    tls,
    timeout: (!arguments.timeout.is_zero()).then_some(arguments.timeout),
    idle_interval: arguments.idle_interval,
  });

  let server = &server;
  crossbeam_utils::thread::scope(|scope| {
    if let Some(listener) = implicit {
      scope.spawn(move |_| {
        if let Err(error) = server.serve(listener, true) {
          log::error!("TLS listener failed: {error:#}");
        }
      });
    }
    server.serve(plaintext, false)
  })
  .map_err(|_| anyhow::anyhow!("a listener panicked"))?
}
