use std::path::PathBuf;
use std::sync::mpsc::Sender;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::auth::{self, SessionUser};
use crate::config::Config;
use crate::feed::{Feed, SubscriptionId};
use crate::notify::Worker;
use crate::roster::RosterStore;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Unsolicited line pushed to the host after the response that caused it.
#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event: &'static str,
    pub subscription_id: String,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(event: &'static str, id: SubscriptionId, payload: serde_json::Value) -> Self {
        Event {
            event,
            subscription_id: id.to_string(),
            payload,
        }
    }
}

pub struct Session {
    pub token: String,
    pub user: SessionUser,
}

pub struct AppState {
    pub config: Config,
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub session: Option<Session>,
    pub roster: RosterStore,
    pub session_feed: Feed<Option<SessionUser>>,
    pub events: Sender<Event>,
    pub notifier: Option<Worker>,
}

impl AppState {
    pub fn new(config: Config, events: Sender<Event>) -> Self {
        AppState {
            config,
            workspace: None,
            db: None,
            session: None,
            roster: RosterStore::new(),
            session_feed: Feed::new(),
            events,
            notifier: None,
        }
    }

    pub fn current_user(&self) -> Option<&SessionUser> {
        self.session.as_ref().map(|s| &s.user)
    }

    /// Replaces the session and tells every session subscriber. Roster
    /// subscriptions were authorized by the outgoing session and end with it.
    pub fn set_session(&mut self, session: Option<Session>) {
        self.session = session;
        self.roster.close_subscriptions();
        let user = self.session.as_ref().map(|s| s.user.clone());
        self.session_feed.publish(&user);
    }

    /// Like `set_session`, but also revokes the outgoing token in the open
    /// workspace unless the new session reuses it.
    pub fn replace_session(&mut self, session: Option<Session>) {
        let outgoing = self
            .session
            .as_ref()
            .map(|s| s.token.as_str())
            .filter(|t| session.as_ref().map(|s| s.token.as_str()) != Some(*t));
        if let (Some(token), Some(conn)) = (outgoing, self.db.as_ref()) {
            if let Err(e) = auth::close_session(conn, token) {
                tracing::warn!(error = %e, "failed to revoke session token");
            }
        }
        self.set_session(session);
    }

    pub fn wake_notifier(&self) {
        if let Some(worker) = &self.notifier {
            worker.wake();
        }
    }
}
