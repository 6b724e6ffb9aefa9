//! services/grader/src/pipeline/notifications.rs
//!
//! Per-course push channels for classroom events.
//!
//! The server never detects disconnects on its own; a channel stays registered until
//! its client stops sending heartbeats, its receiving side goes away, or a newer
//! channel for the same user replaces it. All of those converge on one removal path.
//! A course whose last channel is gone is dropped from the registry.

use crate::pipeline::periodic::spawn_periodic;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

//=========================================================================================
// Events
//=========================================================================================

/// A named event pushed to every client watching a course.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassroomEvent {
    #[serde(rename = "event")]
    pub name: String,
    pub data: serde_json::Value,
}

impl ClassroomEvent {
    pub fn new(name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    /// Delivered once after connecting so the client can send heartbeats.
    pub fn channel_id(id: &str) -> Self {
        Self::new("channel-id", serde_json::Value::from(id))
    }

    pub fn redirect(path: impl Into<String>) -> Self {
        Self::new("redirect", serde_json::Value::from(path.into()))
    }

    pub fn timer_update(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        let window = format!("{}/{}", start.to_rfc3339(), end.to_rfc3339());
        Self::new("timer-update", serde_json::Value::from(window))
    }

    pub fn message(text: impl Into<String>) -> Self {
        Self::new("message", serde_json::Value::from(text.into()))
    }

    pub fn exercise_reset(exercise_slug: &str) -> Self {
        Self::new("example-reset", serde_json::json!({ "exercise": exercise_slug }))
    }
}

//=========================================================================================
// Audiences
//=========================================================================================

/// Which side of the classroom a channel was opened by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Student,
    Supervisor,
}

/// The channels a broadcast is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    Students,
    Supervisors,
    Everyone,
}

impl Audience {
    fn includes(self, role: ChannelRole) -> bool {
        match self {
            Audience::Everyone => true,
            Audience::Students => role == ChannelRole::Student,
            Audience::Supervisors => role == ChannelRole::Supervisor,
        }
    }
}

//=========================================================================================
// Settings and Channel State
//=========================================================================================

#[derive(Debug, Clone)]
pub struct HubSettings {
    pub id_push_delay: Duration,
    pub heartbeat_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            id_push_delay: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

struct Channel {
    user_id: String,
    role: ChannelRole,
    sender: mpsc::UnboundedSender<ClassroomEvent>,
    last_heartbeat: Instant,
}

#[derive(Default)]
struct CourseChannels {
    channels: HashMap<String, Channel>,
    /// The one live channel id of every user.
    by_user: HashMap<String, String>,
    /// Set once the partition has been dropped from the registry; writers must re-fetch.
    retired: bool,
}

impl CourseChannels {
    fn remove(&mut self, channel_id: &str) -> bool {
        let Some(channel) = self.channels.remove(channel_id) else {
            return false;
        };
        if self.by_user.get(&channel.user_id).map(String::as_str) == Some(channel_id) {
            self.by_user.remove(&channel.user_id);
        }
        true
    }
}

/// The receiving end handed to the transport that serves one client.
/// The stream ends when the hub drops the channel.
pub struct ChannelHandle {
    pub id: String,
    pub events: mpsc::UnboundedReceiver<ClassroomEvent>,
}

//=========================================================================================
// The Hub
//=========================================================================================

pub struct NotificationHub {
    settings: HubSettings,
    courses: RwLock<HashMap<String, Arc<Mutex<CourseChannels>>>>,
}

impl NotificationHub {
    pub fn new(settings: HubSettings) -> Arc<Self> {
        Arc::new(Self {
            settings,
            courses: RwLock::new(HashMap::new()),
        })
    }

    async fn partition(&self, course_slug: &str) -> Arc<Mutex<CourseChannels>> {
        if let Some(partition) = self.courses.read().await.get(course_slug) {
            return partition.clone();
        }
        self.courses
            .write()
            .await
            .entry(course_slug.to_string())
            .or_default()
            .clone()
    }

    async fn existing(&self, course_slug: &str) -> Option<Arc<Mutex<CourseChannels>>> {
        self.courses.read().await.get(course_slug).cloned()
    }

    /// Drops the course from the registry if it has no channels left.
    async fn prune(&self, course_slug: &str) {
        let mut courses = self.courses.write().await;
        let Some(partition) = courses.get(course_slug).cloned() else {
            return;
        };
        let mut course = partition.lock().await;
        if course.channels.is_empty() {
            course.retired = true;
            drop(course);
            courses.remove(course_slug);
            debug!(course = course_slug, "Dropped empty course partition.");
        }
    }

    /// Registers a channel for `user_id`, evicting any channel the user already had on
    /// the course. The channel id is pushed to the client after a short delay.
    pub async fn open_channel(
        self: &Arc<Self>,
        course_slug: &str,
        user_id: &str,
        role: ChannelRole,
    ) -> ChannelHandle {
        let id = format!("{}_{}_{}", course_slug, user_id, Uuid::new_v4());
        let (sender, events) = mpsc::unbounded_channel();

        loop {
            let partition = self.partition(course_slug).await;
            let mut course = partition.lock().await;
            if course.retired {
                continue;
            }
            if let Some(previous) = course.by_user.get(user_id).cloned() {
                course.remove(&previous);
                info!(course = course_slug, user = user_id, channel = %previous, "Evicted previous channel.");
            }
            course.channels.insert(
                id.clone(),
                Channel {
                    user_id: user_id.to_string(),
                    role,
                    sender,
                    last_heartbeat: Instant::now(),
                },
            );
            course.by_user.insert(user_id.to_string(), id.clone());
            break;
        }
        info!(course = course_slug, user = user_id, channel = %id, ?role, "Channel opened.");

        let hub = Arc::downgrade(self);
        let course = course_slug.to_string();
        let channel_id = id.clone();
        let delay = self.settings.id_push_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(hub) = hub.upgrade() {
                let event = ClassroomEvent::channel_id(&channel_id);
                hub.send_to(&course, &channel_id, event).await;
            }
        });

        ChannelHandle { id, events }
    }

    async fn send_to(&self, course_slug: &str, channel_id: &str, event: ClassroomEvent) -> bool {
        let Some(partition) = self.existing(course_slug).await else {
            return false;
        };
        let emptied = {
            let mut course = partition.lock().await;
            let Some(channel) = course.channels.get(channel_id) else {
                return false;
            };
            if channel.sender.send(event).is_ok() {
                return true;
            }
            course.remove(channel_id);
            course.channels.is_empty()
        };
        debug!(course = course_slug, channel = channel_id, "Dropped unreachable channel.");
        if emptied {
            self.prune(course_slug).await;
        }
        false
    }

    /// Refreshes the channel's liveness and returns the user it belongs to.
    pub async fn heartbeat(&self, course_slug: &str, channel_id: &str) -> Option<String> {
        let partition = self.existing(course_slug).await?;
        let mut course = partition.lock().await;
        let channel = course.channels.get_mut(channel_id)?;
        channel.last_heartbeat = Instant::now();
        Some(channel.user_id.clone())
    }

    /// Sends `event` to every channel of the course that belongs to `audience` and
    /// returns how many accepted it. Channels that fail are removed.
    pub async fn broadcast(&self, course_slug: &str, audience: Audience, event: ClassroomEvent) -> usize {
        let Some(partition) = self.existing(course_slug).await else {
            return 0;
        };
        let mut failed = Vec::new();
        let mut delivered = 0;
        let emptied = {
            let mut course = partition.lock().await;
            for (id, channel) in course.channels.iter().filter(|(_, c)| audience.includes(c.role)) {
                if channel.sender.send(event.clone()).is_ok() {
                    delivered += 1;
                } else {
                    failed.push(id.clone());
                }
            }
            for id in &failed {
                course.remove(id);
            }
            course.channels.is_empty()
        };
        debug!(
            course = course_slug,
            event = %event.name,
            ?audience,
            delivered,
            dropped = failed.len(),
            "Broadcast sent."
        );
        if emptied {
            self.prune(course_slug).await;
        }
        delivered
    }

    /// Idempotent; returns whether the channel was still registered.
    pub async fn remove_channel(&self, course_slug: &str, channel_id: &str) -> bool {
        let Some(partition) = self.existing(course_slug).await else {
            return false;
        };
        let (removed, emptied) = {
            let mut course = partition.lock().await;
            let removed = course.remove(channel_id);
            (removed, course.channels.is_empty())
        };
        if removed {
            info!(course = course_slug, channel = channel_id, "Channel closed.");
        }
        if emptied {
            self.prune(course_slug).await;
        }
        removed
    }

    /// Number of courses that currently have at least one channel.
    pub async fn course_count(&self) -> usize {
        self.courses.read().await.len()
    }

    pub async fn channel_count(&self, course_slug: &str) -> usize {
        match self.existing(course_slug).await {
            Some(partition) => partition.lock().await.channels.len(),
            None => 0,
        }
    }

    /// Removes every channel whose last heartbeat is older than the liveness threshold.
    pub async fn sweep(&self) -> usize {
        let partitions: Vec<_> = self
            .courses
            .read()
            .await
            .iter()
            .map(|(slug, partition)| (slug.clone(), partition.clone()))
            .collect();
        let timeout = self.settings.heartbeat_timeout;
        let now = Instant::now();

        let mut removed = 0;
        let mut emptied = Vec::new();
        for (slug, partition) in partitions {
            let mut course = partition.lock().await;
            let stale: Vec<String> = course
                .channels
                .iter()
                .filter(|(_, c)| now.duration_since(c.last_heartbeat) > timeout)
                .map(|(id, _)| id.clone())
                .collect();
            for id in stale {
                course.remove(&id);
                removed += 1;
            }
            if course.channels.is_empty() {
                emptied.push(slug);
            }
        }
        for slug in emptied {
            self.prune(&slug).await;
        }
        if removed > 0 {
            info!(removed, "Swept stale channels.");
        }
        removed
    }

    pub fn spawn_sweeper(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let hub = self.clone();
        spawn_periodic("channel-sweep", self.settings.sweep_interval, token, move || {
            let hub = hub.clone();
            async move {
                hub.sweep().await;
            }
        })
    }

    /// Drops every channel, ending all client streams.
    pub async fn close_all(&self) {
        let mut courses = self.courses.write().await;
        let mut closed = 0;
        for partition in courses.values() {
            let mut course = partition.lock().await;
            closed += course.channels.len();
            course.channels.clear();
            course.by_user.clear();
            course.retired = true;
        }
        courses.clear();
        info!(closed, "All notification channels closed.");
    }
}
