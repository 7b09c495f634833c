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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const BASELINE_BOSS_HP: i64 = 1000;
pub const ROUND_SLOTS: usize = 3;
pub const FALLBACK_DAMAGE: i64 = 10;

/// Question shown to a clan before its first raid is started.
pub const DEFAULT_QUESTION: &str =
    "Describe a time you had to overcome a significant challenge.";

pub type ClanId = String;
pub type Username = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RaidStatus {
    Waiting,
    Active,
    Grading,
    Finished,
}

/// Inbound client frame on the raid WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientAction {
    StartRaid,
    SubmitPart { content: String },
}

/// Outbound server frame on the raid WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    StateUpdate { data: RaidSnapshot },
    Notification { message: String },
}

/// Full room state as broadcast to every connected clan member.
///
/// `responses` always carries one entry per round slot; unfilled slots are
/// empty strings. `active_player` is absent unless the raid is active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaidSnapshot {
    pub status: RaidStatus,
    pub active_player: Option<Username>,
    pub responses: Vec<String>,
    pub boss_hp: i64,
    pub question: String,
    pub members: Vec<Username>,
}

/// Result of grading one completed round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundOutcome {
    pub damage: i64,
    pub boss_hp_after: i64,
    pub finished: bool,
    pub graded_at: DateTime<Utc>,
}

/// Roster slot holding the turn, or `None` while the roster is empty.
pub fn active_slot(turn_index: usize, roster_len: usize) -> Option<usize> {
    if roster_len == 0 {
        return None;
    }
    Some(turn_index % roster_len)
}

/// Damage heuristic used when no grader is configured: short answers land a
/// token hit, anything substantial scales with length.
pub fn heuristic_damage(full_response: &str) -> i64 {
    if full_response.len() < 10 {
        return FALLBACK_DAMAGE;
    }
    full_response.len() as i64 * 2
}

/// Built-in question pool, rotated through on each raid start.
pub fn default_question_pool() -> Vec<String> {
    vec![
        "Describe a memorable journey you have taken. (Speak about: Where, When, Who with, Why memorable)"
            .to_string(),
        "Describe a time you had to overcome a significant challenge.".to_string(),
        "Describe a place where you feel completely at peace. (Speak about: Where it is, How often you go, What you do there)"
            .to_string(),
        "Describe a person who changed the way you see the world. (Speak about: Who, How you met, What changed)"
            .to_string(),
    ]
}
