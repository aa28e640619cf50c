use std::collections::VecDeque;
use std::io::Read;
use std::net::{IpAddr, Ipv6Addr};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tiny_http::{Header, Method, Response, Server, StatusCode};
use tracing::{debug, info, warn};

use crate::alarm::model::{AlarmId, AlarmRule};
use crate::error::AlarmError;
use crate::notify::AlarmEvent;
use crate::service::{Command, Reply, ServiceHandle};

pub const DEFAULT_EVENT_HISTORY: usize = 256;
const MAX_BODY_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub bind_addr: String,
    pub port: u16,
    pub event_history: usize,
}

/// Local HTTP control surface. Every request is turned into a service
/// [`Command`]; lifecycle events are kept in a bounded history for polling.
pub struct ApiServer {
    stop: Arc<AtomicBool>,
    http_join: Option<JoinHandle<()>>,
}

impl ApiServer {
    pub fn start(
        config: ApiServerConfig,
        service: ServiceHandle,
        events: Receiver<AlarmEvent>,
    ) -> Result<Self> {
        let bind = format!("{}:{}", config.bind_addr, config.port);
        let server = Server::http(&bind)
            .map_err(|err| anyhow::anyhow!("failed to start API server on {bind}: {err}"))?;
        info!(%bind, "control API listening");
        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_thread = Arc::clone(&stop);
        let history = EventHistory::new(events, config.event_history.max(1));
        let http_join =
            thread::spawn(move || run_server_loop(server, service, history, stop_for_thread));
        Ok(Self {
            stop,
            http_join: Some(http_join),
        })
    }
}

impl Drop for ApiServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.http_join.take() {
            let _ = join.join();
        }
    }
}

/// Most recent lifecycle events, drained from the notifier channel.
struct EventHistory {
    receiver: Receiver<AlarmEvent>,
    recent: VecDeque<AlarmEvent>,
    capacity: usize,
}

impl EventHistory {
    fn new(receiver: Receiver<AlarmEvent>, capacity: usize) -> Self {
        Self {
            receiver,
            recent: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn drain(&mut self) {
        for event in self.receiver.try_iter() {
            if self.recent.len() == self.capacity {
                let _ = self.recent.pop_front();
            }
            self.recent.push_back(event);
        }
    }

    fn snapshot(&self) -> Vec<AlarmEvent> {
        self.recent.iter().copied().collect()
    }
}

fn run_server_loop(
    server: Server,
    service: ServiceHandle,
    mut history: EventHistory,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::Relaxed) {
        history.drain();
        match server.recv_timeout(Duration::from_millis(200)) {
            Ok(Some(request)) => {
                let stop_requested = handle_request(request, &service, &mut history);
                if stop_requested {
                    stop.store(true, Ordering::Relaxed);
                }
            }
            Ok(None) => continue,
            Err(_) => continue,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AlarmAction {
    Enable,
    Disable,
    Snooze,
    Dismiss,
    Skip,
    Unskip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SystemAction {
    Boot,
    TimeZoneChanged,
    TimeChanged,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Health,
    Events,
    ListAlarms,
    CreateAlarm,
    GetAlarm(AlarmId),
    UpdateAlarm(AlarmId),
    DeleteAlarm(AlarmId),
    Alarm(AlarmId, AlarmAction),
    System(SystemAction),
}

#[derive(Debug, PartialEq, Eq)]
enum RouteError {
    NotFound,
    MethodNotAllowed,
    BadId,
}

fn parse_route(method: &Method, path: &str) -> Result<Route, RouteError> {
    let segments = path
        .trim_matches('/')
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>();
    let route = match segments.as_slice() {
        ["v1", "health"] => expect_method(method, Method::Get, Route::Health)?,
        ["v1", "events"] => expect_method(method, Method::Get, Route::Events)?,
        ["v1", "alarms"] => match method {
            Method::Get => Route::ListAlarms,
            Method::Post => Route::CreateAlarm,
            _ => return Err(RouteError::MethodNotAllowed),
        },
        ["v1", "alarms", id] => {
            let id = parse_id(id)?;
            match method {
                Method::Get => Route::GetAlarm(id),
                Method::Put => Route::UpdateAlarm(id),
                Method::Delete => Route::DeleteAlarm(id),
                _ => return Err(RouteError::MethodNotAllowed),
            }
        }
        ["v1", "alarms", id, action] => {
            let action = match *action {
                "enable" => AlarmAction::Enable,
                "disable" => AlarmAction::Disable,
                "snooze" => AlarmAction::Snooze,
                "dismiss" => AlarmAction::Dismiss,
                "skip" => AlarmAction::Skip,
                "unskip" => AlarmAction::Unskip,
                _ => return Err(RouteError::NotFound),
            };
            let id = parse_id(id)?;
            expect_method(method, Method::Post, Route::Alarm(id, action))?
        }
        ["v1", "system", action] => {
            let action = match *action {
                "boot" => SystemAction::Boot,
                "timezone-changed" => SystemAction::TimeZoneChanged,
                "time-changed" => SystemAction::TimeChanged,
                "shutdown" => SystemAction::Shutdown,
                _ => return Err(RouteError::NotFound),
            };
            expect_method(method, Method::Post, Route::System(action))?
        }
        _ => return Err(RouteError::NotFound),
    };
    Ok(route)
}

fn expect_method(method: &Method, expected: Method, route: Route) -> Result<Route, RouteError> {
    if *method == expected {
        Ok(route)
    } else {
        Err(RouteError::MethodNotAllowed)
    }
}

fn parse_id(raw: &str) -> Result<AlarmId, RouteError> {
    raw.parse::<AlarmId>().map_err(|_| RouteError::BadId)
}

#[derive(Debug, Default, Deserialize)]
struct SnoozeRequest {
    #[serde(default)]
    until: Option<DateTime<Utc>>,
}

/// Handles one request. Returns true when the caller asked the daemon to stop.
fn handle_request(
    mut request: tiny_http::Request,
    service: &ServiceHandle,
    history: &mut EventHistory,
) -> bool {
    let Some(remote_addr) = request.remote_addr() else {
        let _ = send_text(request, StatusCode(400), "missing remote address");
        return false;
    };
    let remote_ip = remote_addr.ip();
    if !is_local_network_ip(remote_ip) {
        let _ = send_text(request, StatusCode(403), "forbidden: local network only");
        return false;
    }

    let url = request.url().to_string();
    let (path, _query) = split_path_query(&url);
    let method = request.method().clone();
    debug!(%method, path, remote = %remote_ip, "api request");

    let route = match parse_route(&method, path) {
        Ok(route) => route,
        Err(RouteError::NotFound) => {
            let _ = send_text(request, StatusCode(404), "not found");
            return false;
        }
        Err(RouteError::MethodNotAllowed) => {
            let _ = send_text(request, StatusCode(405), "method not allowed");
            return false;
        }
        Err(RouteError::BadId) => {
            let _ = send_error(request, StatusCode(400), "alarm id must be a number");
            return false;
        }
    };

    let body = match read_body(request.as_reader()) {
        Ok(body) => body,
        Err(BodyError::TooLarge) => {
            let message = format!("request body exceeds {MAX_BODY_BYTES} bytes");
            let _ = send_error(request, StatusCode(413), &message);
            return false;
        }
        Err(BodyError::Unreadable(message)) => {
            let _ = send_error(request, StatusCode(400), &message);
            return false;
        }
    };

    let command = match command_for(route, &body) {
        Ok(Some(command)) => command,
        Ok(None) => {
            let stop = route == Route::System(SystemAction::Shutdown);
            respond_local(request, route, history, service);
            return stop;
        }
        Err(err) => {
            let _ = send_error(request, status_for(&err), &err.to_string());
            return false;
        }
    };

    match service.call(command) {
        Ok(reply) => {
            let _ = send_reply(request, route, reply);
        }
        Err(err) => {
            if !matches!(
                err,
                AlarmError::NotFound(_)
                    | AlarmError::InvalidTransition { .. }
                    | AlarmError::InvalidInput(_)
            ) {
                warn!(path, error = %err, "api request failed");
            }
            let _ = send_error(request, status_for(&err), &err.to_string());
        }
    }
    false
}

/// Maps a route to its service command. Routes answered by the API thread
/// itself map to `None`.
fn command_for(route: Route, body: &str) -> Result<Option<Command>, AlarmError> {
    let command = match route {
        Route::Health | Route::Events | Route::System(SystemAction::Shutdown) => return Ok(None),
        Route::ListAlarms => Command::List,
        Route::GetAlarm(id) => Command::Get(id),
        Route::CreateAlarm => Command::Create(parse_rule(body)?),
        Route::UpdateAlarm(id) => Command::Update(id, parse_rule(body)?),
        Route::DeleteAlarm(id) => Command::Delete(id),
        Route::Alarm(id, AlarmAction::Enable) => Command::Enable(id),
        Route::Alarm(id, AlarmAction::Disable) => Command::Disable(id),
        Route::Alarm(id, AlarmAction::Snooze) => Command::Snooze(id, parse_snooze(body)?.until),
        Route::Alarm(id, AlarmAction::Dismiss) => Command::Dismiss(id),
        Route::Alarm(id, AlarmAction::Skip) => Command::Skip(id),
        Route::Alarm(id, AlarmAction::Unskip) => Command::Unskip(id),
        Route::System(SystemAction::Boot) => Command::Boot,
        Route::System(SystemAction::TimeZoneChanged) => Command::TimeZoneChanged,
        Route::System(SystemAction::TimeChanged) => Command::TimeChanged,
    };
    Ok(Some(command))
}

fn parse_rule(body: &str) -> Result<AlarmRule, AlarmError> {
    serde_json::from_str::<AlarmRule>(body)
        .map_err(|err| AlarmError::InvalidInput(format!("invalid alarm body: {err}")))
}

fn parse_snooze(body: &str) -> Result<SnoozeRequest, AlarmError> {
    if body.trim().is_empty() {
        return Ok(SnoozeRequest::default());
    }
    serde_json::from_str::<SnoozeRequest>(body)
        .map_err(|err| AlarmError::InvalidInput(format!("invalid snooze body: {err}")))
}

fn respond_local(
    request: tiny_http::Request,
    route: Route,
    history: &mut EventHistory,
    service: &ServiceHandle,
) {
    match route {
        Route::Health => {
            let healthy = service.call(Command::List).is_ok();
            let status = if healthy { 200 } else { 503 };
            let _ = send_json(
                request,
                StatusCode(status),
                &json!({ "ok": healthy, "version": env!("CARGO_PKG_VERSION") }),
            );
        }
        Route::Events => {
            history.drain();
            let _ = send_json(request, StatusCode(200), &history.snapshot());
        }
        Route::System(SystemAction::Shutdown) => {
            info!("shutdown requested over control API");
            service.shutdown();
            let _ = send_text(request, StatusCode(200), "ok");
        }
        _ => {
            let _ = send_text(request, StatusCode(404), "not found");
        }
    }
}

fn send_reply(request: tiny_http::Request, route: Route, reply: Reply) -> Result<()> {
    match reply {
        Reply::Alarms(alarms) => send_json(request, StatusCode(200), &alarms),
        Reply::Alarm(alarm) => {
            let status = if route == Route::CreateAlarm { 201 } else { 200 };
            send_json(request, StatusCode(status), &alarm)
        }
        Reply::Deleted(id) => send_json(request, StatusCode(200), &json!({ "deleted": id })),
        Reply::Done => send_json(request, StatusCode(200), &json!({ "ok": true })),
    }
}

fn status_for(err: &AlarmError) -> StatusCode {
    match err {
        AlarmError::NotFound(_) => StatusCode(404),
        AlarmError::InvalidTransition { .. } => StatusCode(409),
        AlarmError::InvalidInput(_) => StatusCode(400),
        AlarmError::Persistence(_) => StatusCode(500),
        AlarmError::ServiceStopped => StatusCode(503),
    }
}

#[derive(Debug)]
enum BodyError {
    TooLarge,
    Unreadable(String),
}

/// Reads the whole body, refusing anything over `MAX_BODY_BYTES`.
fn read_body(reader: &mut dyn Read) -> Result<String, BodyError> {
    let mut bytes = Vec::new();
    reader
        .take(MAX_BODY_BYTES + 1)
        .read_to_end(&mut bytes)
        .map_err(|err| BodyError::Unreadable(format!("unreadable request body: {err}")))?;
    if bytes.len() as u64 > MAX_BODY_BYTES {
        return Err(BodyError::TooLarge);
    }
    String::from_utf8(bytes)
        .map_err(|_| BodyError::Unreadable("request body is not valid UTF-8".to_string()))
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

fn send_error(request: tiny_http::Request, status: StatusCode, message: &str) -> Result<()> {
    send_json(request, status, &ErrorBody { error: message })
}

fn send_json<T: Serialize>(
    request: tiny_http::Request,
    status: StatusCode,
    body: &T,
) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    let content_type = Header::from_str("Content-Type: application/json; charset=utf-8")
        .map_err(|_| anyhow::anyhow!("failed to build content-type header"))?;
    request.respond(
        Response::from_data(payload)
            .with_status_code(status)
            .with_header(content_type),
    )?;
    Ok(())
}

fn send_text(request: tiny_http::Request, status: StatusCode, body: &str) -> Result<()> {
    let content_type = Header::from_str("Content-Type: text/plain; charset=utf-8")
        .map_err(|_| anyhow::anyhow!("failed to build content-type header"))?;
    request.respond(
        Response::from_string(body.to_string())
            .with_status_code(status)
            .with_header(content_type),
    )?;
    Ok(())
}

fn split_path_query(url: &str) -> (&str, &str) {
    match url.split_once('?') {
        Some((path, query)) => (path, query),
        None => (url, ""),
    }
}

fn is_local_network_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || is_ipv4_mapped_local(v6)
        }
    }
}

fn is_ipv4_mapped_local(v6: Ipv6Addr) -> bool {
    match v6.to_ipv4_mapped() {
        Some(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        None => false,
    }
}
