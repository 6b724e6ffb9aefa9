//! Sliding-window count of distinct users active on a course.

use crate::pipeline::periodic::spawn_periodic;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct PresenceSettings {
    pub window: Duration,
    /// How long a computed count may be served, and the period of the full cache eviction.
    pub cache_ttl: Duration,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(5 * 60),
            cache_ttl: Duration::from_secs(60),
        }
    }
}

struct Visit {
    user_id: String,
    at: Instant,
}

#[derive(Default)]
struct CourseVisits {
    /// Arrival order.
    visits: VecDeque<Visit>,
    /// Set once the partition has been dropped from the registry; writers must re-fetch.
    retired: bool,
}

impl CourseVisits {
    fn trim(&mut self, now: Instant, window: Duration) {
        while self
            .visits
            .front()
            .is_some_and(|v| now.duration_since(v.at) > window)
        {
            self.visits.pop_front();
        }
    }
}

pub struct PresenceTracker {
    settings: PresenceSettings,
    courses: RwLock<HashMap<String, Arc<Mutex<CourseVisits>>>>,
    cache: Mutex<HashMap<String, (usize, Instant)>>,
}

impl PresenceTracker {
    pub fn new(settings: PresenceSettings) -> Arc<Self> {
        Arc::new(Self {
            settings,
            courses: RwLock::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
        })
    }

    async fn partition(&self, course_slug: &str) -> Arc<Mutex<CourseVisits>> {
        if let Some(visits) = self.courses.read().await.get(course_slug) {
            return visits.clone();
        }
        self.courses
            .write()
            .await
            .entry(course_slug.to_string())
            .or_default()
            .clone()
    }

    /// Drops the course from the registry if it has no visits left.
    async fn prune(&self, course_slug: &str) {
        let mut courses = self.courses.write().await;
        let Some(partition) = courses.get(course_slug).cloned() else {
            return;
        };
        let mut course = partition.lock().await;
        if course.visits.is_empty() {
            course.retired = true;
            drop(course);
            courses.remove(course_slug);
        }
    }

    pub async fn record(&self, course_slug: &str, user_id: &str) {
        loop {
            let partition = self.partition(course_slug).await;
            let mut course = partition.lock().await;
            if course.retired {
                continue;
            }
            course.visits.push_back(Visit {
                user_id: user_id.to_string(),
                at: Instant::now(),
            });
            return;
        }
    }

    pub async fn recently_active_count(&self, course_slug: &str) -> usize {
        let now = Instant::now();
        if let Some((count, computed_at)) = self.cache.lock().await.get(course_slug) {
            if now.duration_since(*computed_at) < self.settings.cache_ttl {
                return *count;
            }
        }

        let partition = self.courses.read().await.get(course_slug).cloned();
        let count = match partition {
            Some(partition) => {
                let count = {
                    let mut course = partition.lock().await;
                    course.trim(now, self.settings.window);
                    course
                        .visits
                        .iter()
                        .map(|v| v.user_id.as_str())
                        .collect::<HashSet<_>>()
                        .len()
                };
                if count == 0 {
                    self.prune(course_slug).await;
                }
                count
            }
            None => 0,
        };

        self.cache
            .lock()
            .await
            .insert(course_slug.to_string(), (count, now));
        count
    }

    pub async fn course_count(&self) -> usize {
        self.courses.read().await.len()
    }

    /// Clears every cached count and forgets visits that left the window.
    pub async fn evict_cache(&self) {
        {
            let mut cache = self.cache.lock().await;
            debug!(entries = cache.len(), "Evicting presence cache.");
            cache.clear();
        }

        let now = Instant::now();
        let partitions: Vec<(String, Arc<Mutex<CourseVisits>>)> = self
            .courses
            .read()
            .await
            .iter()
            .map(|(slug, partition)| (slug.clone(), partition.clone()))
            .collect();
        for (slug, partition) in partitions {
            let emptied = {
                let mut course = partition.lock().await;
                course.trim(now, self.settings.window);
                course.visits.is_empty()
            };
            if emptied {
                self.prune(&slug).await;
            }
        }
    }

    pub fn spawn_cache_evictor(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let tracker = self.clone();
        spawn_periodic("presence-cache", self.settings.cache_ttl, token, move || {
            let tracker = tracker.clone();
            async move { tracker.evict_cache().await }
        })
    }
}
