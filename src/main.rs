#![allow(dead_code)]

use std::env;
use std::fs::{File, OpenOptions};
use std::os::unix::prelude::IntoRawFd;
use std::path::PathBuf;

use clap::Parser;
use flexi_logger::{FileSpec, Logger};
use log::{error, info};

use crate::context::{ExitStat, SandboxOptions};
use crate::error::{SandboxError, SandboxExit};
use crate::sandbox::run;
use crate::syscall::{AllowAllPolicy, DefaultPolicy, SyscallPolicy};
use crate::utils::default_format;

mod context;
mod error;
mod regs;
mod sandbox;
mod spawner;
mod syscall;
mod timer;
mod utils;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
  #[arg(short, long, help = "Output report")]
  report: bool,

  #[arg(long, requires = "report", help = "Output JSON format report")]
  json: bool,

  #[arg(short, long, help = "Wall-clock limit (unit: ms)")]
  time: Option<u64>,

  #[arg(short, long, help = "Address space limit (unit: KB)")]
  memory: Option<u64>,

  #[arg(short = 'i', long, help = "Redirect stdin [default: inherit]")]
  stdin: Option<String>,

  #[arg(short = 'o', long, help = "Redirect stdout [default: inherit]")]
  stdout: Option<String>,

  #[arg(short = 'e', long, help = "Redirect stderr [default: inherit]")]
  stderr: Option<String>,

  #[arg(long, help = "Working directory of the program")]
  cwd: Option<PathBuf>,

  #[arg(long, value_name = "PATH", help = "File the program may open")]
  allow_file: Vec<String>,

  #[arg(long, help = "Disable the syscall policy, keep limits only")]
  allow_all: bool,

  #[arg(help = "Program to be executed")]
  program: String,

  #[arg(help = "Arguments")]
  arguments: Vec<String>,
}

impl Cli {
  fn resolve(&self) -> Result<SandboxOptions, SandboxError> {
    let mut opts = SandboxOptions::new();

    if let Some(time) = self.time {
      opts.time_limit(time * 1000);
    }
    if let Some(memory) = self.memory {
      opts.memory_limit(memory * 1024);
    }

    if let Some(path) = &self.stdin {
      opts.stdin_fd(File::open(path)?.into_raw_fd());
    }
    if let Some(path) = &self.stdout {
      opts.stdout_fd(open_for_write(path)?);
    }
    if let Some(path) = &self.stderr {
      opts.stderr_fd(open_for_write(path)?);
    }

    Ok(opts)
  }
}

fn open_for_write(path: &str) -> Result<i32, SandboxError> {
  let file = OpenOptions::new()
    .write(true)
    .create(true)
    .truncate(true)
    .open(path)?;
  Ok(file.into_raw_fd())
}

fn execute<P: SyscallPolicy>(
  cli: &Cli,
  opts: &SandboxOptions,
  policy: &mut P,
) -> Result<ExitStat, SandboxError> {
  let cwd = match &cli.cwd {
    Some(path) => path.clone(),
    None => env::current_dir()?,
  };

  let argv = [vec![cli.program.clone()], cli.arguments.clone()].concat();
  run(&cli.program, &argv, opts, &cwd, policy)
}

fn bootstrap() -> Result<(), SandboxError> {
  Logger::try_with_str("ptbox=info")?
    .log_to_file(
      FileSpec::default()
        .directory(env::var("PTBOX_LOG").unwrap_or("./logs/".into()))
        .basename("ptbox")
        .discriminant(format!(
          "{}",
          chrono::offset::Local::now().format("%Y-%m-%d")
        ))
        .suppress_timestamp(),
    )
    .append()
    .format_for_files(default_format)
    .start()?;

  info!("Start running ptbox");

  let cli = Cli::parse();
  let opts = cli.resolve()?;

  let result = if cli.allow_all {
    let mut policy = AllowAllPolicy::new();
    execute(&cli, &opts, &mut policy)
  } else {
    let mut policy = DefaultPolicy::with_allowed_files(cli.allow_file.clone());
    execute(&cli, &opts, &mut policy)
  };

  match result {
    Ok(stat) => {
      info!("Running ptbox finished: {}", stat.message());
      if cli.report {
        if cli.json {
          stat.report_json();
        } else {
          stat.report();
        }
      }
      Ok(())
    }
    Err(err) => {
      error!("Running ptbox failed: {}", err);
      Err(err)
    }
  }
}

fn main() -> SandboxExit {
  match bootstrap() {
    Ok(_) => SandboxExit::Ok,
    Err(err) => SandboxExit::Err(err),
  }
}
