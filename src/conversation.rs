use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ChatError, ChatResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = ChatError;

    fn from_str(s: &str) -> ChatResult<Self> {
        Ok(Self(Uuid::parse_str(s.trim())?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Coach,
    Trainee,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Coach => "coach",
            Role::Trainee => "trainee",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ChatError;

    fn from_str(s: &str) -> ChatResult<Self> {
        match s {
            "coach" => Ok(Role::Coach),
            "trainee" => Ok(Role::Trainee),
            other => Err(ChatError::validation(format!("unknown role {other:?}"))),
        }
    }
}

/// The two people in a coach–trainee thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Participants {
    pub coach: UserId,
    pub trainee: UserId,
}

impl Participants {
    pub fn new(coach: UserId, trainee: UserId) -> ChatResult<Self> {
        if coach == trainee {
            return Err(ChatError::validation("coach and trainee must differ"));
        }
        Ok(Self { coach, trainee })
    }

    pub fn key(&self) -> ConversationKey {
        ConversationKey::ordered(self.coach, self.trainee)
    }

    pub fn role_of(&self, user: UserId) -> Option<Role> {
        if user == self.coach {
            Some(Role::Coach)
        } else if user == self.trainee {
            Some(Role::Trainee)
        } else {
            None
        }
    }

    pub fn counterparty_of(&self, user: UserId) -> Option<UserId> {
        self.key().counterparty_of(user)
    }
}

/// Canonical identifier of a thread, independent of which side derives it.
///
/// Stored as the two ids in ascending order; the text form is `"<low>:<high>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationKey {
    low: UserId,
    high: UserId,
}

impl ConversationKey {
    pub fn between(a: UserId, b: UserId) -> ChatResult<Self> {
        if a == b {
            return Err(ChatError::validation("a conversation needs two distinct users"));
        }
        Ok(Self::ordered(a, b))
    }

    fn ordered(a: UserId, b: UserId) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    pub fn members(&self) -> (UserId, UserId) {
        (self.low, self.high)
    }

    pub fn contains(&self, user: UserId) -> bool {
        self.low == user || self.high == user
    }

    pub fn counterparty_of(&self, user: UserId) -> Option<UserId> {
        if user == self.low {
            Some(self.high)
        } else if user == self.high {
            Some(self.low)
        } else {
            None
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.low, self.high)
    }
}

impl FromStr for ConversationKey {
    type Err = ChatError;

    fn from_str(s: &str) -> ChatResult<Self> {
        let Some((a, b)) = s.split_once(':') else {
            return Err(ChatError::validation(format!("malformed conversation key {s:?}")));
        };
        Self::between(a.parse()?, b.parse()?)
    }
}

impl Serialize for ConversationKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ConversationKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
