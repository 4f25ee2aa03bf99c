use clap::{Parser, Subcommand};
use quiz_intercept::{local_offset, session, ArchiveOutcome, Config};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
  /// Config file, defaults to ./quiz-intercept.toml when present
  #[arg(short, long, global = true, env = "QUIZ_INTERCEPT_CONFIG")]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Launch the capture proxy in the background
  Start {
    /// Silence the proxy's own output
    #[arg(short, long)]
    quiet: bool,
  },
  /// Stop the background capture proxy
  Stop,
  /// Archive the captured questions into the output directory
  Save,
  /// Run the capture proxy in the foreground until Ctrl-C
  Run {
    #[arg(short, long)]
    quiet: bool,
  },
  /// Print the CA certificate path, generating the CA if needed
  Ca,
}

fn init_tracing(quiet: bool) {
  let filter = if quiet {
    tracing_subscriber::EnvFilter::new("error")
  } else {
    tracing_subscriber::EnvFilter::try_from_default_env()
      .unwrap_or_else(|_| "quiz_intercept=info,quiz_intercept_mitm=info".into())
  };
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .init();
}

async fn dispatch(cli: Cli, config: Config, offset: time::UtcOffset) -> quiz_intercept::Result<()> {
  match cli.command {
    Command::Start { quiet } => session::start(&config, cli.config.as_deref(), quiet).await,
    Command::Stop => session::stop(&config).await,
    Command::Run { .. } => session::run_proxy(&config).await,
    Command::Save => {
      match session::save(&config, offset)? {
        ArchiveOutcome::NothingToArchive => println!("No data to save."),
        ArchiveOutcome::Archived {
          text_path,
          json_path,
          ..
        } => println!(
          "Data saved to {} and {}",
          text_path.display(),
          json_path.display()
        ),
      }
      Ok(())
    }
    Command::Ca => {
      let path = session::ca_certificate(&config).await?;
      println!("{}", path.display());
      Ok(())
    }
  }
}

fn main() -> ExitCode {
  // Must be read while the process is still single-threaded.
  let offset = local_offset();
  let cli = Cli::parse();
  let quiet = matches!(
    cli.command,
    Command::Start { quiet: true } | Command::Run { quiet: true }
  );
  init_tracing(quiet);

  let config = match Config::load(cli.config.as_deref()) {
    Ok(config) => config,
    Err(e) => {
      eprintln!("{}", e);
      return ExitCode::FAILURE;
    }
  };
  let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
    Ok(runtime) => runtime,
    Err(e) => {
      eprintln!("failed to start runtime: {}", e);
      return ExitCode::FAILURE;
    }
  };
  match runtime.block_on(dispatch(cli, config, offset)) {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      eprintln!("{}", e);
      ExitCode::FAILURE
    }
  }
}
