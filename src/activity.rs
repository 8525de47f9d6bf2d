use std::{io::Write, time::Duration};

use chrono::{DateTime, Local};
use crossterm::style::Stylize;
use serde_json::{Map, Value};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    api::{Activity, ActivityRequest, PlatformApi},
    error::RunError,
};

pub const ACTIVITY_IDLE_TIMEOUT_DEFAULT: Duration = Duration::from_secs(5 * 60);
pub const ACTIVITY_LIMIT_DEFAULT: u32 = 100;
pub const ACTIVITY_MIN_LEVEL_DEFAULT: &str = "info";
pub const ACTIVITY_POLLING_INTERVAL_DEFAULT: Duration = Duration::from_secs(3);

/// Idle timeout used while tailing alongside a local run.
pub const LOCAL_RUN_IDLE_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityArgs {
    pub team_id: String,
    pub app_id: String,
    pub tail: bool,
    pub polling_interval: Duration,
    pub idle_timeout: Duration,
    pub limit: u32,
    pub min_date_created: i64,
    pub max_date_created: i64,
    pub min_level: String,
    pub event_type: String,
    pub component_type: String,
    pub component_id: String,
    pub source: String,
    pub trace_id: String,
}

impl Default for ActivityArgs {
    fn default() -> Self {
        Self {
            team_id: String::new(),
            app_id: String::new(),
            tail: false,
            polling_interval: ACTIVITY_POLLING_INTERVAL_DEFAULT,
            idle_timeout: ACTIVITY_IDLE_TIMEOUT_DEFAULT,
            limit: ACTIVITY_LIMIT_DEFAULT,
            min_date_created: 0,
            max_date_created: 0,
            min_level: ACTIVITY_MIN_LEVEL_DEFAULT.to_string(),
            event_type: String::new(),
            component_type: String::new(),
            component_id: String::new(),
            source: String::new(),
            trace_id: String::new(),
        }
    }
}

impl ActivityArgs {
    /// Tail settings for the activity stream printed during a local run.
    pub fn for_local_run(team_id: &str, app_id: &str, min_level: &str) -> Self {
        Self {
            team_id: team_id.to_string(),
            app_id: app_id.to_string(),
            tail: true,
            idle_timeout: LOCAL_RUN_IDLE_TIMEOUT,
            min_level: min_level.to_string(),
            min_date_created: Local::now().timestamp_micros(),
            ..Self::default()
        }
    }

    fn request(&self) -> ActivityRequest {
        ActivityRequest {
            app_id: self.app_id.clone(),
            limit: self.limit,
            min_level: self.min_level.clone(),
            event_type: self.event_type.clone(),
            min_date_created: self.min_date_created,
            max_date_created: self.max_date_created,
            component_type: self.component_type.clone(),
            component_id: self.component_id.clone(),
            source: self.source.clone(),
            trace_id: self.trace_id.clone(),
        }
    }
}

/// Prints recent activity and, when tailing, keeps polling until the stream
/// goes idle or `cancel` fires.
pub async fn stream_activity<W: Write + Send>(
    api: &dyn PlatformApi,
    token: &str,
    args: &ActivityArgs,
    out: &mut W,
    cancel: &CancellationToken,
) -> Result<(), RunError> {
    if token.trim().is_empty() {
        return Err(RunError::AuthToken);
    }

    let session = api.validate_session(token).await?;
    if let (Some(user), Some(team)) = (&session.user_name, &session.team_name) {
        writeln!(out, "✨ {}", format!("{user} of {team}").dark_grey())?;
    }

    let mut request = args.request();
    let (newest, _) = print_latest_activity(api, token, &request, out).await?;
    let mut latest = newest.map_or(args.min_date_created, |newest| newest.max(args.min_date_created));
    if !args.tail {
        return Ok(());
    }

    tracing::debug!(
        target = "local_run::activity",
        interval_ms = args.polling_interval.as_millis() as u64,
        "polling activity"
    );
    let mut last_results = Instant::now();
    let mut ticker = interval_at(Instant::now() + args.polling_interval, args.polling_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(target = "local_run::activity", "activity tail cancelled");
                return Ok(());
            }
            _ = ticker.tick() => {
                request.min_date_created = latest + 1;
                let (newest, count) = print_latest_activity(api, token, &request, out)
                    .await
                    .map_err(|e| RunError::StreamingActivityLogs(Box::new(e)))?;

                if count > 0 {
                    last_results = Instant::now();
                }
                if let Some(newest) = newest {
                    latest = latest.max(newest);
                }

                if last_results.elapsed() > args.idle_timeout {
                    writeln!(out, "👋 {}", "Closing due to inactivity. Au revoir!".dark_grey())?;
                    return Ok(());
                }
            }
        }
    }
}

/// Fetches one batch, prints it oldest first, and returns the newest
/// `created` in the batch with the batch size.
async fn print_latest_activity<W: Write + Send>(
    api: &dyn PlatformApi,
    token: &str,
    request: &ActivityRequest,
    out: &mut W,
) -> Result<(Option<i64>, usize), RunError> {
    let result = api.activity(token, request).await?;
    let mut latest = None;

    for activity in result.activities.iter().rev() {
        latest = latest.max(Some(activity.created));
        writeln!(out, "{}", prettify_activity(activity))?;
    }

    Ok((latest, result.activities.len()))
}

const DATASTORE_REQUEST_RESULT: &str = "datastore_request_result";
const EXTERNAL_AUTH_MISSING_FUNCTION: &str = "external_auth_missing_function";
const EXTERNAL_AUTH_MISSING_SELECTED_AUTH: &str = "external_auth_missing_oauth_token_or_selected_auth";
const EXTERNAL_AUTH_RESULT: &str = "external_auth_result";
const EXTERNAL_AUTH_STARTED: &str = "external_auth_started";
const EXTERNAL_AUTH_TOKEN_FETCH_RESULT: &str = "external_auth_token_fetch_result";
const FUNCTION_DEPLOYMENT: &str = "function_deployment";
const FUNCTION_EXECUTION_OUTPUT: &str = "function_execution_output";
const FUNCTION_EXECUTION_RESULT: &str = "function_execution_result";
const FUNCTION_EXECUTION_STARTED: &str = "function_execution_started";
const TRIGGER_EXECUTED: &str = "trigger_executed";
const TRIGGER_PAYLOAD_RECEIVED: &str = "trigger_payload_received";
const WORKFLOW_BILLING_RESULT: &str = "workflow_billing_result";
const WORKFLOW_BOT_INVITED: &str = "workflow_bot_invited";
const WORKFLOW_CREATED_FROM_TEMPLATE: &str = "workflow_created_from_template";
const WORKFLOW_EXECUTION_RESULT: &str = "workflow_execution_result";
const WORKFLOW_EXECUTION_STARTED: &str = "workflow_execution_started";
const WORKFLOW_PUBLISHED: &str = "workflow_published";
const WORKFLOW_STEP_EXECUTION_RESULT: &str = "workflow_step_execution_result";
const WORKFLOW_STEP_STARTED: &str = "workflow_step_started";
const WORKFLOW_UNPUBLISHED: &str = "workflow_unpublished";

const LEVEL_INFO: &str = "info";
const LEVEL_WARN: &str = "warn";
const LEVEL_ERROR: &str = "error";
const LEVEL_FATAL: &str = "fatal";

pub fn prettify_activity(activity: &Activity) -> String {
    let msg = match activity.event_type.as_str() {
        DATASTORE_REQUEST_RESULT => datastore_request_result(activity),
        EXTERNAL_AUTH_MISSING_FUNCTION => log_line(
            activity,
            &format!("Step function '{}' is missing", field(activity, "function_id")),
        ),
        EXTERNAL_AUTH_MISSING_SELECTED_AUTH => log_line(
            activity,
            &format!("Missing mapped token for workflow '{}'", field(activity, "code")),
        ),
        EXTERNAL_AUTH_RESULT => external_auth(activity, "Auth", "for", true),
        EXTERNAL_AUTH_STARTED => external_auth(activity, "Auth start", "by", false),
        EXTERNAL_AUTH_TOKEN_FETCH_RESULT => external_auth(activity, "Token fetch", "for", false),
        FUNCTION_DEPLOYMENT => function_deployment(activity),
        FUNCTION_EXECUTION_OUTPUT => log_line(
            activity,
            &indent(&format!("Function output:\n{}", field(activity, "log")), "\n\t"),
        ),
        TRIGGER_PAYLOAD_RECEIVED => log_line(
            activity,
            &indent(&format!("Trigger payload:\n{}", field(activity, "log")), "\n\t"),
        ),
        FUNCTION_EXECUTION_RESULT => log_line(
            activity,
            &with_error(
                activity,
                format!(
                    "Function '{}' ({} function) {}",
                    field(activity, "function_name"),
                    field(activity, "function_type"),
                    outcome(activity)
                ),
            ),
        ),
        FUNCTION_EXECUTION_STARTED => log_line(
            activity,
            &format!(
                "Function '{}' ({} function) started",
                field(activity, "function_name"),
                field(activity, "function_type")
            ),
        ),
        TRIGGER_EXECUTED => trigger_executed(activity),
        WORKFLOW_BILLING_RESULT => workflow_billing_result(activity),
        WORKFLOW_BOT_INVITED => log_line(
            activity,
            &format!(
                "Channel {} detected in workflow configuration. Bot user {} automatically invited.",
                field(activity, "channel_id"),
                field(activity, "bot_user_id")
            ),
        ),
        WORKFLOW_CREATED_FROM_TEMPLATE => log_line(
            activity,
            &format!(
                "Workflow '{}' created from template '{}'",
                field(activity, "workflow_name"),
                field(activity, "template_id")
            ),
        ),
        WORKFLOW_EXECUTION_RESULT => log_line(
            activity,
            &with_error(
                activity,
                format!("Workflow '{}' {}", field(activity, "workflow_name"), outcome(activity)),
            ),
        ),
        WORKFLOW_EXECUTION_STARTED => log_line(
            activity,
            &format!("Workflow '{}' started", field(activity, "workflow_name")),
        ),
        WORKFLOW_PUBLISHED => log_line(
            activity,
            &format!("Workflow '{}' published", field(activity, "workflow_name")),
        ),
        WORKFLOW_STEP_EXECUTION_RESULT => log_line(
            activity,
            &format!(
                "Workflow step '{}' {}",
                field(activity, "function_name"),
                outcome(activity)
            ),
        ),
        WORKFLOW_STEP_STARTED => log_line(
            activity,
            &format!(
                "Workflow step {} of {} started",
                whole_number(activity, "current_step"),
                whole_number(activity, "total_steps")
            ),
        ),
        WORKFLOW_UNPUBLISHED => log_line(
            activity,
            &format!("Workflow '{}' unpublished", field(activity, "workflow_name")),
        ),
        _ => {
            let payload = activity
                .payload
                .as_ref()
                .and_then(|p| serde_json::to_string(p).ok())
                .unwrap_or_default();
            log_line(activity, &payload)
        }
    };

    match activity.level.as_str() {
        LEVEL_WARN => msg.yellow().to_string(),
        LEVEL_ERROR | LEVEL_FATAL => msg.red().to_string(),
        _ => msg,
    }
}

/// Local wall-clock rendering of an activity's microsecond timestamp.
pub fn created_pretty(created: i64) -> String {
    DateTime::from_timestamp(created / 1_000_000, 0)
        .map(|ts| ts.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

fn log_line(activity: &Activity, msg: &str) -> String {
    log_line_for(activity, &activity.component_id, msg)
}

fn log_line_for(activity: &Activity, component: &str, msg: &str) -> String {
    format!(
        "{} [{}] [{}] (Trace={}) {}",
        created_pretty(activity.created),
        activity.level,
        component,
        activity.trace_id,
        msg
    )
}

fn payload(activity: &Activity) -> Option<&Map<String, Value>> {
    activity.payload.as_ref()
}

fn raw_field<'a>(activity: &'a Activity, key: &str) -> Option<&'a Value> {
    payload(activity).and_then(|p| p.get(key))
}

/// Renders a payload field as plain text; absent fields render empty.
fn field(activity: &Activity, key: &str) -> String {
    match raw_field(activity, key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn whole_number(activity: &Activity, key: &str) -> String {
    raw_field(activity, key)
        .and_then(Value::as_f64)
        .map(|n| format!("{n:.0}"))
        .unwrap_or_default()
}

fn indent(text: &str, with: &str) -> String {
    text.replace('\n', with)
}

fn is_failure(activity: &Activity) -> bool {
    matches!(activity.level.as_str(), LEVEL_ERROR | LEVEL_FATAL)
}

fn outcome(activity: &Activity) -> &'static str {
    if is_failure(activity) {
        "failed"
    } else {
        "completed"
    }
}

fn with_error(activity: &Activity, msg: String) -> String {
    match raw_field(activity, "error") {
        Some(_) => format!("{msg}\n\t{}", indent(&field(activity, "error"), "\n\t")),
        None => msg,
    }
}

fn datastore_request_result(activity: &Activity) -> String {
    let request_type = field(activity, "request_type");
    let details = field(activity, "details");
    let datastore = match raw_field(activity, "datastore_name") {
        Some(_) => format!("Datastore:{}", field(activity, "datastore_name")),
        None => String::new(),
    };
    let msg = if is_failure(activity) {
        format!(
            "Datastore {request_type} failed with '{details}'\n\t{}",
            field(activity, "error")
        )
    } else {
        format!("Datastore {request_type} succeeded with '{details}'")
    };
    log_line_for(activity, &datastore, &msg)
}

fn external_auth(activity: &Activity, action: &str, preposition: &str, extra_message: bool) -> String {
    let state = match (activity.level == LEVEL_ERROR, extra_message) {
        (true, _) => "failed",
        (false, true) => "completed",
        (false, false) => "succeeded",
    };
    let mut msg = format!(
        "{action} {state} {preposition} user '{}' on team '{}' for app '{}' and provider '{}'",
        field(activity, "user_id"),
        field(activity, "team_id"),
        field(activity, "app_id"),
        field(activity, "provider_key")
    );
    if activity.level == LEVEL_ERROR {
        msg.push_str("\n\t");
        msg.push_str(&indent(&field(activity, "code"), "\n\t"));
        if extra_message {
            msg.push_str("\n\t\t");
            msg.push_str(&indent(&field(activity, "extra_message"), "\n\t\t"));
        }
    }
    msg.dark_grey().to_string()
}

fn function_deployment(activity: &Activity) -> String {
    let msg = format!(
        "Application {}d by user '{}' on team '{}'",
        field(activity, "action"),
        field(activity, "user_id"),
        field(activity, "team_id")
    );
    format!(
        "☁️  {} [{}] {}",
        created_pretty(activity.created),
        activity.level,
        msg
    )
    .dark_grey()
    .to_string()
}

fn trigger_executed(activity: &Activity) -> String {
    let mut msgs = Vec::new();
    let function_name = field(activity, "function_name");

    if activity.level == LEVEL_INFO {
        let trigger_type = raw_field(activity, "trigger")
            .and_then(Value::as_object)
            .and_then(|trigger| trigger.get("type"))
            .and_then(Value::as_str);
        match trigger_type {
            Some(kind) => msgs.push(format!(
                "{} trigger successfully started execution of function '{function_name}'",
                title_case(kind)
            )),
            None => msgs.push(format!(
                "Trigger successfully started execution of function '{function_name}'"
            )),
        }
    } else if activity.level == LEVEL_ERROR {
        msgs.push(format!(
            "Trigger for workflow '{function_name}' failed: {}",
            field(activity, "reason")
        ));
        let errors = raw_field(activity, "errors")
            .and_then(Value::as_str)
            .and_then(|raw| serde_json::from_str::<Vec<String>>(raw).ok());
        if let Some(errors) = errors {
            msgs.extend(errors.into_iter().map(|e| format!("  - {e}")));
        }
    }

    msgs.iter()
        .map(|msg| log_line(activity, msg))
        .collect::<Vec<_>>()
        .join("\n")
}

fn workflow_billing_result(activity: &Activity) -> String {
    let mut msg = match raw_field(activity, "workflow_name") {
        Some(_) => format!("Workflow '{}'", field(activity, "workflow_name")),
        None => "Workflow".to_string(),
    };
    if raw_field(activity, "is_billing_result") == Some(&Value::Bool(true)) {
        msg = format!("{msg} billing reason '{}'", field(activity, "billing_reason"));
    } else {
        msg = format!("{msg} is excluded from billing");
    }
    log_line(activity, &msg)
}

fn title_case(text: &str) -> String {
    text.split('_')
        .flat_map(|part| part.split(' '))
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}
