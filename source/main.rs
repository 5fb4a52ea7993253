use clap::Parser as _;
use std::path;

#[derive(clap::Parser)]
#[command(about = "A small IMAP server")]
struct Arguments {
  #[clap(flatten)]
  arguments: postern::Arguments,
  #[arg(
    long = "log-directory",
    help = "Log directory",
    default_value_t = String::from("$ENV{XDG_RUNTIME_DIR}")
  )]
  pub log_directory: String,
  #[clap(flatten)]
  verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,
}

// Everything goes to the file, the console only shows what the verbosity allows. The TLS and HTTP
// stacks are chatty at trace level (handshakes, every record) so they're capped.
fn logging(directory: &path::Path, console: log::LevelFilter) -> anyhow::Result<()> {
  use log4rs::{append, config, encode, filter};

  let encoder = Box::new(encode::pattern::PatternEncoder::new(
    "{d(%F %T)} {l} {t} - {m}{n}",
  ));
  let file = append::file::FileAppender::builder()
    .encoder(encoder.clone())
    .build(directory.join("postern.log"))?;
  let console_ = append::console::ConsoleAppender::builder()
    .encoder(encoder)
    .build();

  let mut builder = config::Config::builder()
    .appender(
      config::Appender::builder()
        .filter(Box::new(filter::threshold::ThresholdFilter::new(
          log::LevelFilter::Trace,
        )))
        .build("file", Box::new(file)),
    )
    .appender(
      config::Appender::builder()
        .filter(Box::new(filter::threshold::ThresholdFilter::new(console)))
        .build("console", Box::new(console_)),
    );
  for noisy in ["rustls", "ureq"] {
    builder = builder.logger(config::Logger::builder().build(noisy, log::LevelFilter::Info));
  }
  log4rs::init_config(
    builder.build(
      config::Root::builder()
        .appenders(["console", "file"])
        .build(log::LevelFilter::Trace),
    )?,
  )?;
  Ok(())
}

fn main() -> anyhow::Result<()> {
  let arguments = Arguments::parse();
  logging(
    path::Path::new(&arguments.log_directory),
    arguments.verbose.log_level_filter(),
  )?;
  log::info!(
    "starting {} {}",
    env!("CARGO_PKG_NAME"),
    env!("CARGO_PKG_VERSION")
  );
  postern::run(&arguments.arguments)
}
