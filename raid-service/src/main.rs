// Copyright (C) 2026 SynapseRaid
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{Path, State, WebSocketUpgrade, ws::{Message, WebSocket}},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use raid_common::{
    BASELINE_BOSS_HP, ClanId, ClientAction, DEFAULT_QUESTION, FALLBACK_DAMAGE, ROUND_SLOTS,
    RaidSnapshot, RaidStatus, RoundOutcome, ServerMessage, Username, active_slot,
    default_question_pool, heuristic_damage,
};
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc, oneshot};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

const ROOM_QUEUE_DEPTH: usize = 256;
const OUTBOUND_QUEUE_DEPTH: usize = 64;
const DEFAULT_GRADING_TIMEOUT_SECONDS: u64 = 20;
const GRADING_ANNOUNCEMENT: &str = "All parts submitted! Assessing damage...";

#[derive(Clone)]
struct AppState {
    registry: RoomRegistry,
    directory: Arc<dyn ParticipantDirectory>,
    scorer: Arc<dyn ScoringGateway>,
    settings: Arc<RaidSettings>,
}

#[derive(Clone, Default)]
struct RoomRegistry {
    rooms: Arc<RwLock<HashMap<ClanId, mpsc::Sender<RoomCommand>>>>,
}

struct RaidSettings {
    grading_timeout: Duration,
    turn_timeout: Option<Duration>,
    question_pool: Vec<String>,
}

impl AppState {
    fn from_env() -> anyhow::Result<Self> {
        let grading_timeout_seconds = std::env::var("GRADING_TIMEOUT_SECONDS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_GRADING_TIMEOUT_SECONDS)
            .max(1);
        let turn_timeout_seconds = std::env::var("TURN_TIMEOUT_SECONDS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0);

        let settings = RaidSettings {
            grading_timeout: Duration::from_secs(grading_timeout_seconds),
            turn_timeout: (turn_timeout_seconds > 0)
                .then(|| Duration::from_secs(turn_timeout_seconds)),
            question_pool: load_question_pool(),
        };

        let scorer: Arc<dyn ScoringGateway> = match non_empty_env("GRADER_BASE_URL") {
            Some(base_url) => Arc::new(HttpScoringGateway::new(base_url)?),
            None => Arc::new(LocalScoringGateway),
        };
        let directory: Arc<dyn ParticipantDirectory> = match non_empty_env("DIRECTORY_BASE_URL") {
            Some(base_url) => Arc::new(HttpParticipantDirectory::new(base_url)),
            None => Arc::new(NoopParticipantDirectory),
        };

        Ok(Self {
            registry: RoomRegistry::default(),
            directory,
            scorer,
            settings: Arc::new(settings),
        })
    }

    /// Hands out the command queue of the clan's room actor, spawning the
    /// actor on first use.
    async fn room(&self, clan_id: &str) -> mpsc::Sender<RoomCommand> {
        if let Some(tx) = self.registry.rooms.read().await.get(clan_id) {
            return tx.clone();
        }

        let mut rooms = self.registry.rooms.write().await;
        if let Some(tx) = rooms.get(clan_id) {
            return tx.clone();
        }

        let (tx, rx) = mpsc::channel(ROOM_QUEUE_DEPTH);
        let context = RoomContext {
            feedback: tx.clone(),
            scorer: self.scorer.clone(),
            settings: self.settings.clone(),
        };
        tokio::spawn(run_raid_room(clan_id.to_string(), rx, context));
        rooms.insert(clan_id.to_string(), tx.clone());
        tx
    }

    async fn peek_room(&self, clan_id: &str) -> Option<mpsc::Sender<RoomCommand>> {
        self.registry.rooms.read().await.get(clan_id).cloned()
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[derive(Debug, Clone, Deserialize)]
struct QuestionPoolFile {
    questions: Vec<String>,
}

fn load_question_pool() -> Vec<String> {
    let Some(path) = non_empty_env("RAID_PROMPTS_CONFIG_PATH") else {
        return default_question_pool();
    };

    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(error) => {
            warn!(path = %path, error = %error, "failed to read raid prompts config file");
            return default_question_pool();
        }
    };

    match serde_yaml::from_str::<QuestionPoolFile>(&raw) {
        Ok(file) if !file.questions.is_empty() => {
            info!(path = %path, count = file.questions.len(), "loaded raid question pool from YAML config");
            file.questions
        }
        Ok(_) => {
            warn!(path = %path, "raid prompts config file has no questions");
            default_question_pool()
        }
        Err(error) => {
            warn!(path = %path, error = %error, "failed to parse raid prompts config yaml");
            default_question_pool()
        }
    }
}

fn pick_question(pool: &[String], current: &str) -> String {
    let fresh: Vec<&String> = pool.iter().filter(|q| q.as_str() != current).collect();
    if fresh.is_empty() {
        return current.to_string();
    }
    let mut rng = rand::rng();
    fresh[rng.random_range(0..fresh.len())].clone()
}

#[async_trait]
trait ParticipantDirectory: Send + Sync {
    async fn ensure_registered(&self, clan_id: &str, username: &str) -> anyhow::Result<()>;
}

struct NoopParticipantDirectory;

#[async_trait]
impl ParticipantDirectory for NoopParticipantDirectory {
    async fn ensure_registered(&self, _clan_id: &str, _username: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
struct HttpParticipantDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpParticipantDirectory {
    fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl ParticipantDirectory for HttpParticipantDirectory {
    async fn ensure_registered(&self, clan_id: &str, username: &str) -> anyhow::Result<()> {
        let url = self.endpoint(&format!("internal/v1/clans/{clan_id}/participants"));
        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({ "username": username }))
            .send()
            .await
            .context("failed to call participant directory")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<response body unavailable>".to_string());
            anyhow::bail!("participant directory returned {status}: {body}");
        }

        Ok(())
    }
}

#[async_trait]
trait ScoringGateway: Send + Sync {
    async fn score(&self, full_response: &str) -> anyhow::Result<i64>;
}

struct LocalScoringGateway;

#[async_trait]
impl ScoringGateway for LocalScoringGateway {
    async fn score(&self, full_response: &str) -> anyhow::Result<i64> {
        Ok(heuristic_damage(full_response))
    }
}

struct HttpScoringGateway {
    client: reqwest::Client,
    base_url: String,
    damage_pattern: Regex,
}

impl HttpScoringGateway {
    fn new(base_url: String) -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
            damage_pattern: Regex::new(r"-?\d+").context("invalid damage salvage pattern")?,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/grade", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Clone, Serialize)]
struct GradeRequest<'a> {
    transcript: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
struct GradeResponse {
    damage: i64,
}

#[async_trait]
impl ScoringGateway for HttpScoringGateway {
    async fn score(&self, full_response: &str) -> anyhow::Result<i64> {
        let response = self
            .client
            .post(self.endpoint())
            .json(&GradeRequest {
                transcript: full_response,
            })
            .send()
            .await
            .context("failed to call grader")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_else(|_| "".to_string());
            anyhow::bail!("grader returned {status}: {body}");
        }

        let body = response.text().await.context("failed to read grader response")?;
        if let Ok(grade) = serde_json::from_str::<GradeResponse>(&body) {
            return Ok(grade.damage);
        }
        salvage_damage(&self.damage_pattern, &body)
    }
}

/// Graders occasionally wrap the verdict in prose; pull the first integer out
/// of the body before giving up on the response.
fn salvage_damage(pattern: &Regex, body: &str) -> anyhow::Result<i64> {
    let Some(found) = pattern.find(body) else {
        anyhow::bail!("grader response carried no damage value: {body}");
    };
    found
        .as_str()
        .parse::<i64>()
        .context("failed to parse salvaged damage value")
}

async fn settle_damage(scorer: &dyn ScoringGateway, full_response: &str, deadline: Duration) -> i64 {
    match tokio::time::timeout(deadline, scorer.score(full_response)).await {
        Ok(Ok(damage)) => damage.max(0),
        Ok(Err(error)) => {
            warn!(error = %error, "scoring failed; using fallback damage");
            FALLBACK_DAMAGE
        }
        Err(_) => {
            warn!(
                timeout_seconds = deadline.as_secs(),
                "scoring timed out; using fallback damage"
            );
            FALLBACK_DAMAGE
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "raid_service=debug,tower_http=info".to_string()),
        )
        .init();

    let state = AppState::from_env()?;
    let app = build_router(state);

    let bind_addr = parse_bind_addr("RAID_SERVICE_BIND", "0.0.0.0:8085")?;
    info!(%bind_addr, "raid-service listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/raids/{clan_id}", get(snapshot_handler))
        .route("/ws/raids/{clan_id}/{username}", get(raid_stream_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

fn parse_bind_addr(var_name: &str, default: &str) -> anyhow::Result<SocketAddr> {
    let value = std::env::var(var_name)
        .ok()
        .unwrap_or_else(|| default.to_string());
    value.parse().context(format!("invalid {var_name}"))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true, "service": "raid-service"}))
}

async fn snapshot_handler(
    State(state): State<AppState>,
    Path(clan_id): Path<String>,
) -> Result<Json<RaidSnapshot>, ApiError> {
    let room = state
        .peek_room(&clan_id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("raid room {} not found", clan_id)))?;

    let (reply_tx, reply_rx) = oneshot::channel();
    room.send(RoomCommand::Snapshot { reply: reply_tx })
        .await
        .map_err(|_| ApiError::internal("raid room unavailable"))?;
    let snapshot = reply_rx
        .await
        .map_err(|_| ApiError::internal("raid room dropped the snapshot request"))?;
    Ok(Json(snapshot))
}

async fn raid_stream_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    Path((clan_id, username)): Path<(String, String)>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, clan_id, username))
}

async fn handle_socket(socket: WebSocket, state: AppState, clan_id: ClanId, username: Username) {
    if let Err(error) = state.directory.ensure_registered(&clan_id, &username).await {
        warn!(
            clan_id = %clan_id,
            username = %username,
            error = %error,
            "participant directory lookup failed; joining anyway"
        );
    }

    let room = state.room(&clan_id).await;
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE_DEPTH);
    let connection_id = Uuid::new_v4();
    let joined = room
        .send(RoomCommand::Join {
            username: username.clone(),
            connection: ConnectionSlot {
                id: connection_id,
                outbound: outbound_tx.clone(),
            },
        })
        .await;
    if joined.is_err() {
        warn!(clan_id = %clan_id, username = %username, "raid room unavailable for new connection");
        return;
    }
    info!(
        clan_id = %clan_id,
        username = %username,
        connection_id = %connection_id,
        "raid stream connected"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();
    tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = ws_rx.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let action = match serde_json::from_str::<ClientAction>(text.as_str()) {
            Ok(action) => action,
            Err(error) => {
                warn!(clan_id = %clan_id, username = %username, error = %error, "malformed raid action");
                send_rejection(&outbound_tx, format!("invalid action: {error}")).await;
                continue;
            }
        };
        if let Err(reason) = validate_action(&action) {
            warn!(clan_id = %clan_id, username = %username, reason, "invalid raid action payload");
            send_rejection(&outbound_tx, format!("invalid action: {reason}")).await;
            continue;
        }

        if room
            .send(RoomCommand::Action {
                username: username.clone(),
                action,
            })
            .await
            .is_err()
        {
            break;
        }
    }

    let _ = room
        .send(RoomCommand::Leave {
            username: username.clone(),
            connection_id,
        })
        .await;
    info!(
        clan_id = %clan_id,
        username = %username,
        connection_id = %connection_id,
        "raid stream closed"
    );
}

async fn send_rejection(outbound: &mpsc::Sender<String>, message: String) {
    let Some(frame) = encode_message(&ServerMessage::Notification { message }) else {
        return;
    };
    let _ = outbound.send(frame).await;
}

fn validate_action(action: &ClientAction) -> Result<(), &'static str> {
    match action {
        ClientAction::StartRaid => Ok(()),
        ClientAction::SubmitPart { content } => {
            if content.trim().is_empty() {
                Err("EMPTY_CONTENT")
            } else {
                Ok(())
            }
        }
    }
}

enum RoomCommand {
    Join {
        username: Username,
        connection: ConnectionSlot,
    },
    Leave {
        username: Username,
        connection_id: Uuid,
    },
    Action {
        username: Username,
        action: ClientAction,
    },
    ScoreSettled {
        lifecycle: u64,
        damage: i64,
    },
    TurnExpired {
        lifecycle: u64,
        turn_index: usize,
    },
    Snapshot {
        reply: oneshot::Sender<RaidSnapshot>,
    },
}

struct ConnectionSlot {
    id: Uuid,
    outbound: mpsc::Sender<String>,
}

struct RoomContext {
    feedback: mpsc::Sender<RoomCommand>,
    scorer: Arc<dyn ScoringGateway>,
    settings: Arc<RaidSettings>,
}

struct RaidRoom {
    clan_id: ClanId,
    session: RaidSession,
    connections: HashMap<Username, ConnectionSlot>,
    // Bumped on every raid start; commands stamped with an older value are
    // echoes of a superseded round lifecycle and must be discarded.
    lifecycle: u64,
}

/// Serializing worker for one clan's raid room. All session mutations flow
/// through this queue, one command at a time.
async fn run_raid_room(
    clan_id: ClanId,
    mut inbound: mpsc::Receiver<RoomCommand>,
    context: RoomContext,
) {
    let mut room = RaidRoom {
        clan_id,
        session: RaidSession::new(),
        connections: HashMap::new(),
        lifecycle: 0,
    };
    info!(clan_id = %room.clan_id, "raid room opened");

    while let Some(command) = inbound.recv().await {
        handle_room_command(&mut room, &context, command);
    }

    info!(clan_id = %room.clan_id, "raid room closed");
}

fn handle_room_command(room: &mut RaidRoom, context: &RoomContext, command: RoomCommand) {
    match command {
        RoomCommand::Join {
            username,
            connection,
        } => {
            room.session.add_member(&username);
            if let Some(previous) = room.connections.insert(username.clone(), connection) {
                info!(
                    clan_id = %room.clan_id,
                    username = %username,
                    superseded_connection = %previous.id,
                    "connection superseded by reconnect"
                );
            } else {
                info!(clan_id = %room.clan_id, username = %username, "clan member connected");
            }
            broadcast_state(room);
        }
        RoomCommand::Leave {
            username,
            connection_id,
        } => {
            let current = room.connections.get(&username).map(|slot| slot.id);
            if current == Some(connection_id) {
                room.connections.remove(&username);
                info!(clan_id = %room.clan_id, username = %username, "clan member disconnected");
            }
        }
        RoomCommand::Action { username, action } => apply_action(room, context, username, action),
        RoomCommand::ScoreSettled { lifecycle, damage } => {
            if lifecycle != room.lifecycle {
                warn!(
                    clan_id = %room.clan_id,
                    lifecycle,
                    current_lifecycle = room.lifecycle,
                    "discarding stale round score"
                );
                return;
            }
            if room.session.status != RaidStatus::Grading {
                warn!(clan_id = %room.clan_id, "score settled outside grading; ignoring");
                return;
            }

            let outcome = room.session.settle_round(damage);
            info!(
                clan_id = %room.clan_id,
                damage = outcome.damage,
                boss_hp = outcome.boss_hp_after,
                finished = outcome.finished,
                graded_at = %outcome.graded_at,
                "round graded"
            );
            broadcast_notification(
                room,
                &format!("CRITICAL HIT! {} Damage Dealt.", outcome.damage),
            );
            broadcast_state(room);
        }
        RoomCommand::TurnExpired {
            lifecycle,
            turn_index,
        } => {
            // A timer that slept through a raid restart or a turn advance is
            // late; the stamps no longer match and it must do nothing.
            if lifecycle != room.lifecycle
                || room.session.status != RaidStatus::Active
                || room.session.turn_index != turn_index
            {
                return;
            }
            let Some(stalled) = room.session.active_player().map(str::to_string) else {
                return;
            };

            let advance = room.session.skip_turn();
            warn!(
                clan_id = %room.clan_id,
                username = %stalled,
                turn_index,
                "turn expired; submitting empty part"
            );
            broadcast_notification(
                room,
                &format!("{stalled} ran out of time; their part was skipped."),
            );
            match advance {
                SubmitAdvance::NextTurn => {
                    arm_turn_timer(room, context);
                    broadcast_state(room);
                }
                SubmitAdvance::RoundComplete => finish_round(room, context),
            }
        }
        RoomCommand::Snapshot { reply } => {
            let _ = reply.send(room.session.snapshot());
        }
    }
}

fn apply_action(room: &mut RaidRoom, context: &RoomContext, username: Username, action: ClientAction) {
    match action {
        ClientAction::StartRaid => {
            let question = pick_question(&context.settings.question_pool, &room.session.question);
            match room.session.begin_round(question) {
                Ok(()) => {
                    room.lifecycle += 1;
                    info!(
                        clan_id = %room.clan_id,
                        username = %username,
                        question = %room.session.question,
                        boss_hp = room.session.boss_hp,
                        "raid started"
                    );
                    arm_turn_timer(room, context);
                    broadcast_state(room);
                }
                Err(reason) => reject_action(room, &username, "start_raid", reason),
            }
        }
        ClientAction::SubmitPart { content } => match room.session.submit(&username, &content) {
            Ok(SubmitAdvance::NextTurn) => {
                info!(
                    clan_id = %room.clan_id,
                    username = %username,
                    turn_index = room.session.turn_index,
                    "part accepted"
                );
                arm_turn_timer(room, context);
                broadcast_state(room);
            }
            Ok(SubmitAdvance::RoundComplete) => {
                info!(clan_id = %room.clan_id, username = %username, "final part accepted");
                finish_round(room, context);
            }
            Err(reason) => reject_action(room, &username, "submit_part", reason),
        },
    }
}

fn reject_action(room: &mut RaidRoom, username: &str, kind: &str, reason: &str) {
    warn!(
        clan_id = %room.clan_id,
        username = %username,
        action = kind,
        reason,
        "raid action rejected"
    );
    notify_member(room, username, &format!("{kind} rejected: {reason}"));
}

/// Announces grading and hands the assembled transcript to the scorer off the
/// room's command path; the verdict comes back as a `ScoreSettled` command.
fn finish_round(room: &mut RaidRoom, context: &RoomContext) {
    broadcast_notification(room, GRADING_ANNOUNCEMENT);
    broadcast_state(room);

    let transcript = room.session.responses.join(" ");
    let lifecycle = room.lifecycle;
    let clan_id = room.clan_id.clone();
    let scorer = context.scorer.clone();
    let feedback = context.feedback.clone();
    let deadline = context.settings.grading_timeout;
    tokio::spawn(async move {
        let damage = settle_damage(scorer.as_ref(), &transcript, deadline).await;
        if feedback
            .send(RoomCommand::ScoreSettled { lifecycle, damage })
            .await
            .is_err()
        {
            warn!(clan_id = %clan_id, "raid room closed before the round score settled");
        }
    });
}

fn arm_turn_timer(room: &RaidRoom, context: &RoomContext) {
    let Some(timeout) = context.settings.turn_timeout else {
        return;
    };
    let lifecycle = room.lifecycle;
    let turn_index = room.session.turn_index;
    let feedback = context.feedback.clone();
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        let _ = feedback
            .send(RoomCommand::TurnExpired {
                lifecycle,
                turn_index,
            })
            .await;
    });
}

fn broadcast_state(room: &mut RaidRoom) {
    let Some(frame) = encode_message(&ServerMessage::StateUpdate {
        data: room.session.snapshot(),
    }) else {
        return;
    };
    deliver_all(&room.clan_id, &mut room.connections, &frame);
}

fn broadcast_notification(room: &mut RaidRoom, text: &str) {
    let Some(frame) = encode_message(&ServerMessage::Notification {
        message: text.to_string(),
    }) else {
        return;
    };
    deliver_all(&room.clan_id, &mut room.connections, &frame);
}

fn notify_member(room: &mut RaidRoom, username: &str, text: &str) {
    let Some(frame) = encode_message(&ServerMessage::Notification {
        message: text.to_string(),
    }) else {
        return;
    };
    deliver_to(&room.clan_id, &mut room.connections, username, &frame);
}

fn encode_message(message: &ServerMessage) -> Option<String> {
    match serde_json::to_string(message) {
        Ok(frame) => Some(frame),
        Err(error) => {
            warn!(error = %error, "failed to encode server frame");
            None
        }
    }
}

fn deliver_all(clan_id: &str, connections: &mut HashMap<Username, ConnectionSlot>, frame: &str) {
    connections.retain(|username, slot| {
        if slot.outbound.try_send(frame.to_string()).is_ok() {
            true
        } else {
            warn!(
                clan_id = %clan_id,
                username = %username,
                "dropping unreachable raid connection"
            );
            false
        }
    });
}

fn deliver_to(
    clan_id: &str,
    connections: &mut HashMap<Username, ConnectionSlot>,
    username: &str,
    frame: &str,
) {
    let Some(slot) = connections.get(username) else {
        return;
    };
    if slot.outbound.try_send(frame.to_string()).is_err() {
        connections.remove(username);
        warn!(
            clan_id = %clan_id,
            username = %username,
            "dropping unreachable raid connection"
        );
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SubmitAdvance {
    NextTurn,
    RoundComplete,
}

/// Turn state machine for one clan's raid. Mutated only by the room worker.
struct RaidSession {
    status: RaidStatus,
    turn_index: usize,
    responses: Vec<String>,
    roster: Vec<Username>,
    boss_hp: i64,
    question: String,
}

impl RaidSession {
    fn new() -> Self {
        Self {
            status: RaidStatus::Waiting,
            turn_index: 0,
            responses: vec![String::new(); ROUND_SLOTS],
            roster: Vec::new(),
            boss_hp: BASELINE_BOSS_HP,
            question: DEFAULT_QUESTION.to_string(),
        }
    }

    /// Roster is append-only: members who disconnect keep their slot so the
    /// turn order stays stable across rejoins.
    fn add_member(&mut self, username: &str) {
        if !self.roster.iter().any(|member| member == username) {
            self.roster.push(username.to_string());
        }
    }

    fn active_player(&self) -> Option<&str> {
        if self.status != RaidStatus::Active {
            return None;
        }
        let slot = active_slot(self.turn_index, self.roster.len())?;
        Some(self.roster[slot].as_str())
    }

    fn begin_round(&mut self, question: String) -> Result<(), &'static str> {
        match self.status {
            RaidStatus::Active => return Err("RAID_ALREADY_ACTIVE"),
            RaidStatus::Grading => return Err("GRADING_IN_PROGRESS"),
            RaidStatus::Waiting | RaidStatus::Finished => {}
        }
        if self.roster.is_empty() {
            return Err("NO_PARTICIPANTS");
        }

        // Reopening a defeated boss is the one place the hp pool resets.
        if self.status == RaidStatus::Finished {
            self.boss_hp = BASELINE_BOSS_HP;
        }
        self.responses = vec![String::new(); ROUND_SLOTS];
        self.turn_index = 0;
        self.question = question;
        self.status = RaidStatus::Active;
        Ok(())
    }

    fn submit(&mut self, username: &str, content: &str) -> Result<SubmitAdvance, &'static str> {
        if self.status != RaidStatus::Active {
            return Err("RAID_NOT_ACTIVE");
        }
        if self.active_player() != Some(username) {
            return Err("NOT_YOUR_TURN");
        }
        if content.trim().is_empty() {
            return Err("EMPTY_CONTENT");
        }

        self.responses[self.turn_index] = content.to_string();
        Ok(self.advance_turn())
    }

    /// Timeout path: the slot stays empty, only the pointer moves.
    fn skip_turn(&mut self) -> SubmitAdvance {
        self.advance_turn()
    }

    fn advance_turn(&mut self) -> SubmitAdvance {
        self.turn_index += 1;
        if self.turn_index >= ROUND_SLOTS {
            self.status = RaidStatus::Grading;
            SubmitAdvance::RoundComplete
        } else {
            SubmitAdvance::NextTurn
        }
    }

    fn settle_round(&mut self, damage: i64) -> RoundOutcome {
        self.boss_hp -= damage;
        self.status = if self.boss_hp <= 0 {
            RaidStatus::Finished
        } else {
            RaidStatus::Waiting
        };
        RoundOutcome {
            damage,
            boss_hp_after: self.boss_hp,
            finished: self.status == RaidStatus::Finished,
            graded_at: Utc::now(),
        }
    }

    fn snapshot(&self) -> RaidSnapshot {
        RaidSnapshot {
            status: self.status,
            active_player: self.active_player().map(str::to_string),
            responses: self.responses.clone(),
            boss_hp: self.boss_hp,
            question: self.question.clone(),
            members: self.roster.clone(),
        }
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(status = %self.status, message = %self.message, "request failed");
        (
            self.status,
            Json(serde_json::json!({"error": self.message})),
        )
            .into_response()
    }
}
