use std::{path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{
    activity::{
        ActivityArgs, ACTIVITY_IDLE_TIMEOUT_DEFAULT, ACTIVITY_LIMIT_DEFAULT, ACTIVITY_MIN_LEVEL_DEFAULT,
        ACTIVITY_POLLING_INTERVAL_DEFAULT,
    },
    api::DEFAULT_API_HOST,
    run::RunArgs,
};

#[derive(Debug, Parser)]
#[command(name = "local-run")]
#[command(about = "Runs a platform app locally and streams its activity")]
pub struct Cli {
    /// Tracing filter, e.g. `debug` or `local_run::server=trace`. Falls back to RUST_LOG.
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Emit machine-readable lifecycle events on stderr.
    #[arg(long, global = true, default_value_t = false)]
    pub json_output: bool,

    #[arg(long, global = true, env = "PLATFORM_TOKEN", hide_env_values = true, default_value = "")]
    pub token: String,

    #[arg(long, global = true, default_value = DEFAULT_API_HOST)]
    pub api_host: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Install the app to a workspace and relay its events to the local project.
    Run(RunCommand),
    /// Print app activity logs, optionally tailing them.
    Activity(ActivityCommand),
}

#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    #[arg(long, default_value = "")]
    pub app_id: String,

    #[arg(long, default_value = "")]
    pub team_id: String,

    #[arg(long, default_value = ".")]
    pub project_dir: PathBuf,

    /// Stream activity logs while the app runs.
    #[arg(long, default_value_t = false)]
    pub activity: bool,

    #[arg(long, default_value = ACTIVITY_MIN_LEVEL_DEFAULT)]
    pub activity_level: String,

    /// Delete the local app when the run is interrupted.
    #[arg(long, default_value_t = false)]
    pub cleanup: bool,

    /// Workspace to grant access to when installing into an organization.
    #[arg(long = "org-workspace-grant")]
    pub org_workspace_grant: Option<String>,
}

impl RunCommand {
    pub fn into_args(self, token: &str, api_host: &str) -> RunArgs {
        RunArgs {
            token: token.to_string(),
            app_id: self.app_id,
            team_id: self.team_id,
            api_host: api_host.to_string(),
            project_dir: self.project_dir,
            activity: self.activity,
            activity_level: self.activity_level,
            cleanup: self.cleanup,
            org_grant_workspace_id: self.org_workspace_grant.filter(|id| !id.is_empty()),
        }
    }
}

#[derive(Debug, Args, Clone)]
pub struct ActivityCommand {
    #[arg(long, default_value = "")]
    pub app_id: String,

    #[arg(long, default_value = "")]
    pub team_id: String,

    /// Keep polling for new activity.
    #[arg(long, default_value_t = false)]
    pub tail: bool,

    #[arg(long, default_value_t = ACTIVITY_POLLING_INTERVAL_DEFAULT.as_millis() as u64)]
    pub interval_ms: u64,

    #[arg(long, default_value_t = ACTIVITY_IDLE_TIMEOUT_DEFAULT.as_secs() / 60)]
    pub idle_timeout_minutes: u64,

    #[arg(long, default_value_t = ACTIVITY_LIMIT_DEFAULT)]
    pub limit: u32,

    #[arg(long, default_value = ACTIVITY_MIN_LEVEL_DEFAULT)]
    pub min_level: String,

    #[arg(long, default_value = "")]
    pub event: String,

    #[arg(long, default_value = "")]
    pub component: String,

    #[arg(long, default_value = "")]
    pub component_id: String,

    #[arg(long, default_value = "")]
    pub source: String,

    #[arg(long, default_value = "")]
    pub trace_id: String,

    /// Lower bound on `date_created`, in microseconds.
    #[arg(long, default_value_t = 0)]
    pub min_date_created: i64,

    /// Upper bound on `date_created`, in microseconds.
    #[arg(long, default_value_t = 0)]
    pub max_date_created: i64,
}

impl ActivityCommand {
    pub fn into_args(self) -> ActivityArgs {
        ActivityArgs {
            team_id: self.team_id,
            app_id: self.app_id,
            tail: self.tail,
            polling_interval: Duration::from_millis(self.interval_ms.max(1)),
            idle_timeout: Duration::from_secs(self.idle_timeout_minutes * 60),
            limit: self.limit,
            min_date_created: self.min_date_created,
            max_date_created: self.max_date_created,
            min_level: self.min_level,
            event_type: self.event,
            component_type: self.component,
            component_id: self.component_id,
            source: self.source,
            trace_id: self.trace_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, time::Duration};

    use clap::Parser;

    use super::{Cli, Command};
    use crate::activity::ActivityArgs;

    #[test]
    fn run_defaults() {
        let cli = Cli::parse_from(["local-run", "run", "--token", "xoxp-1", "--app-id", "A123"]);
        assert_eq!(cli.api_host, "https://slack.com");
        assert!(!cli.json_output);
        assert!(cli.log_level.is_none());

        let Command::Run(run) = cli.command else {
            panic!("expected run command");
        };
        let args = run.into_args(&cli.token, &cli.api_host);
        assert_eq!(args.token, "xoxp-1");
        assert_eq!(args.app_id, "A123");
        assert_eq!(args.project_dir, PathBuf::from("."));
        assert_eq!(args.activity_level, "info");
        assert!(!args.activity);
        assert!(!args.cleanup);
        assert!(args.org_grant_workspace_id.is_none());
    }

    #[test]
    fn global_flags_follow_subcommand() {
        let cli = Cli::parse_from([
            "local-run",
            "run",
            "--cleanup",
            "--org-workspace-grant",
            "T999",
            "--json-output",
            "--log-level",
            "debug",
        ]);
        assert!(cli.json_output);
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        let Command::Run(run) = cli.command else {
            panic!("expected run command");
        };
        let args = run.into_args("", "https://slack.com");
        assert!(args.cleanup);
        assert_eq!(args.org_grant_workspace_id.as_deref(), Some("T999"));
    }

    #[test]
    fn activity_defaults_match_stream_defaults() {
        let cli = Cli::parse_from(["local-run", "activity", "--app-id", "A1"]);
        let Command::Activity(activity) = cli.command else {
            panic!("expected activity command");
        };
        let args = activity.into_args();
        let defaults = ActivityArgs::default();
        assert_eq!(args.polling_interval, defaults.polling_interval);
        assert_eq!(args.idle_timeout, defaults.idle_timeout);
        assert_eq!(args.limit, defaults.limit);
        assert_eq!(args.min_level, defaults.min_level);
        assert!(!args.tail);
    }

    #[test]
    fn activity_filters_are_mapped() {
        let cli = Cli::parse_from([
            "local-run",
            "activity",
            "--tail",
            "--interval-ms",
            "500",
            "--idle-timeout-minutes",
            "1",
            "--event",
            "function_execution_output",
            "--component",
            "functions",
            "--trace-id",
            "Tr1",
        ]);
        let Command::Activity(activity) = cli.command else {
            panic!("expected activity command");
        };
        let args = activity.into_args();
        assert!(args.tail);
        assert_eq!(args.polling_interval, Duration::from_millis(500));
        assert_eq!(args.idle_timeout, Duration::from_secs(60));
        assert_eq!(args.event_type, "function_execution_output");
        assert_eq!(args.component_type, "functions");
        assert_eq!(args.trace_id, "Tr1");
    }
}
