use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

use crate::config::ClientConfig;
use crate::lab::{LabClient, Log, OneShotFlow, RequestState, RequestStatus, StreamingFlow};

/// lab-client - run lab modules and follow their streamed output
#[derive(Parser)]
#[command(name = "lab-client")]
#[command(about = "Fetch lab module specs and stream module runs")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Configuration file path
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Lab server base URL (overrides the config file)
    #[arg(long, global = true)]
    pub base_url: Option<String>,
}

impl Cli {
    /// Fold command line flags into the loaded configuration
    pub fn apply_overrides(&self, config: &mut ClientConfig) {
        if self.debug {
            config.debug = true;
        }
        if let Some(ref base_url) = self.base_url {
            config.base_url = base_url.clone();
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Fetch a module's spec with a single request
    Spec(ModuleArgs),

    /// Execute a module and print its log as it streams
    Run(RunArgs),

    /// Fetch the spec and stream a run at the same time
    Both(RunArgs),

    /// Show the effective configuration
    Config(ConfigArgs),
}

#[derive(Args)]
pub struct ModuleArgs {
    /// Module name (defaults to the configured module)
    #[arg(long, short)]
    pub module: Option<String>,
}

#[derive(Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub module: ModuleArgs,

    /// Module argument, repeatable
    #[arg(long = "arg", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub args: Vec<(String, String)>,
}

#[derive(Args)]
pub struct ConfigArgs {
    /// Write the effective configuration to the config file
    #[arg(long)]
    pub write: bool,
}

/// Parse `KEY=VALUE`
pub fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

/// Render a settled one-shot state
pub fn render_spec(state: &RequestState<serde_json::Value>) -> String {
    match state.status() {
        RequestStatus::Idle => String::new(),
        RequestStatus::Pending => "Loading...".to_string(),
        RequestStatus::Success => state
            .result()
            .map(|value| serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()))
            .unwrap_or_default(),
        RequestStatus::Error => format!("Error: {}", state.error_message().unwrap_or("unknown error")),
    }
}

/// Render what changed after one streaming update
pub fn render_stream_change(state: &RequestState<Log>) -> String {
    let entries = state.result().map(Log::len).unwrap_or(0);
    match state.status() {
        RequestStatus::Pending => state
            .result()
            .and_then(Log::last)
            .map(|entry| entry.formatted())
            .unwrap_or_default(),
        RequestStatus::Success => format!("-- stream completed ({} entries)\n", entries),
        RequestStatus::Error => format!(
            "-- Error: {} ({} entries received)\n",
            state.error_message().unwrap_or("unknown error"),
            entries
        ),
        RequestStatus::Idle => String::new(),
    }
}

/// Executes parsed commands against a lab server
pub struct CliHandler {
    config: ClientConfig,
    config_path: Option<PathBuf>,
    client: LabClient,
}

impl CliHandler {
    pub fn new(config: ClientConfig, config_path: Option<PathBuf>) -> Result<Self> {
        let client = LabClient::from_config(&config)?;
        Ok(Self {
            config,
            config_path,
            client,
        })
    }

    pub async fn handle(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Spec(args) => self.handle_spec(args).await,
            Commands::Run(args) => self.handle_run(args).await,
            Commands::Both(args) => self.handle_both(args).await,
            Commands::Config(args) => self.handle_config(args).await,
        }
    }

    fn module_name(&self, args: &ModuleArgs) -> String {
        args.module
            .clone()
            .unwrap_or_else(|| self.config.default_module.clone())
    }

    fn module_args(&self, args: &RunArgs) -> BTreeMap<String, String> {
        let mut merged = self.config.args.clone();
        merged.extend(args.args.iter().cloned());
        merged
    }

    async fn handle_spec(&self, args: ModuleArgs) -> Result<()> {
        let mut flow = OneShotFlow::new(self.client.clone());
        flow.trigger(&self.module_name(&args));
        let state = flow.settle().await;
        println!("{}", render_spec(state));
        settled_ok(state.status(), state.error_message())
    }

    async fn handle_run(&self, args: RunArgs) -> Result<()> {
        let mut flow = StreamingFlow::new(self.client.clone());
        flow.trigger(&self.module_name(&args.module), self.module_args(&args));

        let mut stdout = std::io::stdout();
        while flow.next_change().await.is_some() {
            write!(stdout, "{}", render_stream_change(flow.state()))?;
            stdout.flush()?;
        }

        let state = flow.state();
        settled_ok(state.status(), state.error_message())
    }

    async fn handle_both(&self, args: RunArgs) -> Result<()> {
        let module = self.module_name(&args.module);
        let mut spec = OneShotFlow::new(self.client.clone());
        let mut run = StreamingFlow::new(self.client.clone());
        spec.trigger(&module);
        run.trigger(&module, self.module_args(&args));

        let mut spec_done = false;
        let mut run_done = false;
        while !(spec_done && run_done) {
            tokio::select! {
                change = spec.next_change(), if !spec_done => {
                    if change.is_none() {
                        spec_done = true;
                        println!("[spec]\n{}", render_spec(spec.state()));
                    }
                }
                change = run.next_change(), if !run_done => {
                    match change {
                        Some(_) => print!("[run] {}", render_stream_change(run.state())),
                        None => run_done = true,
                    }
                }
            }
        }

        settled_ok(spec.state().status(), spec.state().error_message())?;
        settled_ok(run.state().status(), run.state().error_message())
    }

    async fn handle_config(&self, args: ConfigArgs) -> Result<()> {
        if args.write {
            let path = self
                .config_path
                .clone()
                .ok_or_else(|| anyhow!("No configuration path available"))?;
            self.config.save_to_file(&path).await?;
            println!("Configuration written to {}", path.display());
        } else {
            print!("{}", toml::to_string_pretty(&self.config)?);
        }
        Ok(())
    }
}

fn settled_ok(status: RequestStatus, error_message: Option<&str>) -> Result<()> {
    match status {
        RequestStatus::Error => Err(anyhow!(error_message.unwrap_or("request failed").to_string())),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lab::{LogEntry, SentAt};

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("arg1=a=b"),
            Ok(("arg1".to_string(), "a=b".to_string()))
        );
        assert_eq!(parse_key_value("empty="), Ok(("empty".to_string(), String::new())));
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=x").is_err());
    }

    #[test]
    fn test_cli_parses_run_args() {
        let cli = Cli::try_parse_from([
            "lab-client",
            "--base-url",
            "http://127.0.0.1:9",
            "run",
            "-m",
            "foo",
            "--arg",
            "arg1=x",
            "--arg",
            "arg2=y",
        ])
        .unwrap();

        let mut config = ClientConfig::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.base_url, "http://127.0.0.1:9");

        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.module.module.as_deref(), Some("foo"));
                assert_eq!(args.args.len(), 2);
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn test_render_spec_states() {
        let mut state = RequestState::new();
        assert_eq!(render_spec(&state), "");

        let generation = state.trigger();
        assert_eq!(render_spec(&state), "Loading...");

        state.on_error(generation, "HTTP error! status: 500");
        assert_eq!(render_spec(&state), "Error: HTTP error! status: 500");

        let generation = state.trigger();
        state.on_success(generation, serde_json::json!({"module": "foo"}));
        assert_eq!(render_spec(&state), "{\n  \"module\": \"foo\"\n}");
    }

    #[test]
    fn test_render_stream_change() {
        let mut state = RequestState::new();
        let generation = state.trigger();
        state.on_partial_result(
            generation,
            LogEntry::new(SentAt::Text("T1".to_string()), "hi".to_string()),
        );
        assert_eq!(render_stream_change(&state), "[T1] hi\n\n");

        state.on_error(generation, "connection dropped");
        assert_eq!(
            render_stream_change(&state),
            "-- Error: connection dropped (1 entries received)\n"
        );
    }

    #[test]
    fn test_settled_ok_reports_errors() {
        assert!(settled_ok(RequestStatus::Success, None).is_ok());
        let err = settled_ok(RequestStatus::Error, Some("HTTP error! status: 500")).unwrap_err();
        assert!(err.to_string().contains("500"));
    }
}
