mod args;
mod report;

use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;
use storelaunch_core::{LaunchOptions, RunMode, DEFAULT_TIMEOUT, LOCK_FILE_NAME};
use storelaunch_runtime::select_backend;
use tracing::debug;

const EXIT_FAILURE: i32 = 1;

#[derive(Debug, Parser)]
#[command(
    name = "storelaunch",
    version,
    about = "Install, launch, monitor and uninstall a Windows Store application",
    override_usage = "storelaunch [options] <Appx Manifest Path> [<execution args>]",
    after_help = "Options are written -name or /name and must come before the manifest path.\n\
                  Environment: STORELAUNCH_LOG, STORELAUNCH_BACKEND, STORELAUNCH_MOCK_SCENARIO,\n\
                  STORELAUNCH_SKIP_PREREQS, SMARTY_JOB_ID."
)]
struct Cli {
    /// Launch the application under the specified debugger.
    #[arg(long, value_name = "debugger cmd line")]
    debug: Option<String>,

    /// The time to wait for the app to exit (default: 120000).
    #[arg(long, value_name = "ms")]
    timeout: Option<u64>,

    /// The app is a test and will exit on its own.
    #[arg(long, default_value_t = false)]
    test: bool,

    /// Run the application in the foreground.
    #[arg(long, default_value_t = false)]
    foreground: bool,

    /// Delay launching the app by the specified time.
    #[arg(long = "delaylaunch", value_name = "ms", default_value_t = 0)]
    delay_launch: u64,

    /// Install the application and quit.
    #[arg(long, default_value_t = false)]
    install: bool,

    /// Uninstall the application and quit.
    #[arg(long, default_value_t = false)]
    uninstall: bool,

    /// The prefix used for file disambiguation.
    #[arg(long = "disPrefix", value_name = "name", default_value = "")]
    dis_prefix: String,

    /// File that is disambiguated.
    #[arg(long = "disFile", value_name = "name")]
    dis_files: Vec<PathBuf>,

    /// The application ID to start.
    #[arg(long = "appId", value_name = "id")]
    app_id: Option<String>,

    /// Enable verbose (debug) logging output.
    #[arg(long, default_value_t = false)]
    verbose: bool,

    /// Path to the AppxManifest.xml file.
    #[arg(value_name = "Appx Manifest Path")]
    manifest: Option<PathBuf>,

    /// The arguments to pass to the application.
    #[arg(value_name = "execution args", trailing_var_arg = true, allow_hyphen_values = true)]
    execution_args: Vec<String>,
}

impl Cli {
    fn mode(&self) -> RunMode {
        if self.uninstall {
            RunMode::UninstallOnly
        } else if self.install {
            RunMode::InstallOnly
        } else {
            RunMode::Run
        }
    }

    fn into_options(self, manifest_path: PathBuf) -> LaunchOptions {
        let mode = self.mode();
        LaunchOptions {
            manifest_path,
            app_id: self.app_id.filter(|id| !id.is_empty()),
            debugger: self.debug,
            timeout: self.timeout.map_or(DEFAULT_TIMEOUT, Duration::from_millis),
            test_app: self.test,
            run_in_background: !self.foreground,
            delay_launch: Duration::from_millis(self.delay_launch),
            mode,
            execution_args: self.execution_args,
            disambiguation_prefix: self.dis_prefix,
            disambiguated_files: self.dis_files,
            job_name: env_nonempty("SMARTY_JOB_ID"),
            lock_path: PathBuf::from(LOCK_FILE_NAME),
            check_prereqs: std::env::var("STORELAUNCH_SKIP_PREREQS").as_deref() != Ok("1"),
        }
    }
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn print_usage() {
    let _ = Cli::command().print_help();
    println!();
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("STORELAUNCH_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();
}

fn main() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    std::process::exit(cli_main(std::env::args_os().collect()));
}

fn cli_main(argv: Vec<OsString>) -> i32 {
    if argv.len() <= 1 {
        print_usage();
        return 0;
    }

    let argv = match args::normalize(argv) {
        Ok(argv) => argv,
        Err(option) => {
            println!("Error: Option {option} missing argument");
            print_usage();
            return EXIT_FAILURE;
        }
    };

    let cli = match Cli::try_parse_from(argv) {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return 0;
        }
        Err(e) => {
            let _ = e.print();
            return EXIT_FAILURE;
        }
    };

    init_logging(cli.verbose);

    let Some(manifest) = cli.manifest.clone() else {
        eprintln!("Error: Missing appx manifest path");
        print_usage();
        return EXIT_FAILURE;
    };
    println!("Got manifest file {}", manifest.display());

    let backend_name = env_nonempty("STORELAUNCH_BACKEND").unwrap_or_else(|| "windows".to_owned());
    let scenario = std::env::var_os("STORELAUNCH_MOCK_SCENARIO").map(PathBuf::from);
    let backend = match select_backend(&backend_name, scenario.as_deref()) {
        Ok(backend) => backend,
        Err(e) => {
            println!("{}", report::failure(e.code(), &e.to_string()));
            return EXIT_FAILURE;
        }
    };

    let options = cli.into_options(manifest);
    debug!("{options:?}");
    match storelaunch_core::run(backend.as_ref(), &options) {
        Ok(run) => {
            if let Some(name) = &run.package_full_name {
                println!("Package Full Name is {name}");
            }
            if let Some(output) = &run.app_output {
                println!("{}", report::app_output(output));
            }
            println!("{}", report::success(run.exit_code));
            run.exit_code as i32
        }
        Err(e) => {
            println!("{}", report::failure(e.hresult(), &e.to_string()));
            EXIT_FAILURE
        }
    }
}
