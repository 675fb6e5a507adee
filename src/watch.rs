//! Live update streams built on the API server's watch primitive.
//!
//! Each subscription runs one supervisor task:
//!
//! ```text
//! Connecting -> Streaming -> (Reconnecting -> Streaming | Closed)
//! ```
//!
//! An authentication failure while connecting goes through the gateway's
//! retry-once policy. One discovered mid-stream triggers a single refresh
//! and a single reconnect from the last seen resource version; a second
//! consecutive failure is delivered to the subscriber and the stream closes.
//! A stream the server ends is resumed the same way, under the same budget:
//! two ends or failures in a row with no event in between close it with
//! [`Error::WatchClosed`]. Every other failure is delivered immediately.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::{WatchEvent as ApiEvent, WatchParams};
use kube::Resource;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::gateway::{ClientSet, Gateway};
use crate::metrics::{self, MetricsKind, UsageMap};
use crate::resources::{object_key, KindDescriptor};
use crate::settings::Settings;

pub type EventStream<K> = BoxStream<'static, kube::Result<ApiEvent<K>>>;

/// A change to one object, carrying its list-item projection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "object", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
}

impl<T> WatchEvent<T> {
    pub fn object(&self) -> &T {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => o,
        }
    }

    fn map<U>(self, f: impl FnOnce(T) -> U) -> WatchEvent<U> {
        match self {
            WatchEvent::Added(o) => WatchEvent::Added(f(o)),
            WatchEvent::Modified(o) => WatchEvent::Modified(f(o)),
            WatchEvent::Deleted(o) => WatchEvent::Deleted(f(o)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Connecting,
    Streaming,
    Reconnecting,
    Closed,
}

/// The receiving end of a watch.
///
/// Cancelling (or dropping) the subscription stops the supervisor and
/// suppresses delivery of anything still queued.
pub struct Subscription<T> {
    rx: mpsc::Receiver<Result<WatchEvent<T>>>,
    cancel: CancellationToken,
    state: watch::Receiver<StreamState>,
}

impl<T> Subscription<T> {
    /// The next event, or `None` once the stream is closed or cancelled.
    pub async fn next(&mut self) -> Option<Result<WatchEvent<T>>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            item = self.rx.recv() => item,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    /// Resolves once the supervisor has stopped.
    pub async fn closed(&mut self) {
        let _ = self.state.wait_for(|s| *s == StreamState::Closed).await;
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Where watch streams and usage snapshots come from.
#[async_trait]
pub trait WatchSource<D: KindDescriptor>: Send + Sync + 'static {
    async fn open(
        &self,
        clients: Arc<ClientSet>,
        namespace: Option<String>,
        resource_version: String,
    ) -> Result<EventStream<D::Object>>;

    async fn usage(
        &self,
        gateway: &Gateway,
        kind: MetricsKind,
        namespace: Option<&str>,
    ) -> Result<UsageMap>;
}

/// Watches the API server directly.
pub struct KubeSource;

#[async_trait]
impl<D: KindDescriptor> WatchSource<D> for KubeSource {
    async fn open(
        &self,
        clients: Arc<ClientSet>,
        namespace: Option<String>,
        resource_version: String,
    ) -> Result<EventStream<D::Object>> {
        let api = D::api(clients.client(), namespace.as_deref());
        let stream = api
            .watch(&WatchParams::default(), &resource_version)
            .await?;
        Ok(stream.boxed())
    }

    async fn usage(
        &self,
        gateway: &Gateway,
        kind: MetricsKind,
        namespace: Option<&str>,
    ) -> Result<UsageMap> {
        metrics::fetch_usage(gateway, kind, namespace).await
    }
}

pub struct WatchManager {
    gateway: Arc<Gateway>,
    interval: Duration,
    capacity: usize,
}

impl WatchManager {
    pub fn new(gateway: Arc<Gateway>, settings: &Settings) -> Self {
        WatchManager {
            gateway,
            interval: settings.metrics_refresh(),
            capacity: settings.watch_channel_capacity.max(1),
        }
    }

    /// Starts watching `D` in `namespace` (all namespaces when `None`).
    ///
    /// The stream ends when `cancel` fires, when the subscription is
    /// dropped, or after a failure has been delivered.
    pub fn subscribe<D: KindDescriptor>(
        &self,
        namespace: Option<String>,
        cancel: &CancellationToken,
    ) -> Subscription<D::Item> {
        self.subscribe_with::<D>(Arc::new(KubeSource), namespace, cancel)
    }

    pub fn subscribe_with<D: KindDescriptor>(
        &self,
        source: Arc<dyn WatchSource<D>>,
        namespace: Option<String>,
        cancel: &CancellationToken,
    ) -> Subscription<D::Item> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let (state_tx, state_rx) = watch::channel(StreamState::Connecting);
        let cancel = cancel.child_token();

        let supervisor = Supervisor::<D> {
            gateway: self.gateway.clone(),
            source,
            namespace,
            interval: self.interval,
            tx,
            state: state_tx,
            cache: HashMap::new(),
            usage: UsageMap::new(),
            resource_version: "0".to_string(),
        };
        tokio::spawn(supervisor.run(cancel.clone()));

        Subscription {
            rx,
            cancel,
            state: state_rx,
        }
    }
}

struct Supervisor<D: KindDescriptor> {
    gateway: Arc<Gateway>,
    source: Arc<dyn WatchSource<D>>,
    namespace: Option<String>,
    interval: Duration,
    tx: mpsc::Sender<Result<WatchEvent<D::Item>>>,
    state: watch::Sender<StreamState>,
    /// Last projection per object, kept only to re-emit merged usage.
    cache: HashMap<String, D::Item>,
    usage: UsageMap,
    resource_version: String,
}

impl<D: KindDescriptor> Supervisor<D> {
    fn scope(&self) -> String {
        format!("{} in {}", D::KIND, self.namespace.as_deref().unwrap_or("all namespaces"))
    }

    async fn run(mut self, cancel: CancellationToken) {
        log::debug!("watch: starting {}", self.scope());
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            result = self.stream() => result,
        };
        match outcome {
            Err(e) if !cancel.is_cancelled() => {
                log::warn!("watch: {} failed: {e}", self.scope());
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = self.tx.send(Err(e)) => {}
                }
            }
            _ => log::debug!("watch: {} closed", self.scope()),
        }
        self.cache.clear();
        self.state.send_replace(StreamState::Closed);
    }

    fn set_state(&self, state: StreamState) {
        self.state.send_replace(state);
    }

    /// Opens the stream through the gateway, so an authentication failure
    /// gets one refresh and one retry.
    async fn connect(&self) -> Result<(Arc<ClientSet>, EventStream<D::Object>)> {
        let source = &self.source;
        let namespace = &self.namespace;
        let resource_version = &self.resource_version;
        self.gateway
            .call(|clients| async move {
                let events = source
                    .open(clients.clone(), namespace.clone(), resource_version.clone())
                    .await?;
                Ok::<_, Error>((clients, events))
            })
            .await
    }

    /// Returns `Ok` when the subscriber went away, `Err` on a failure that
    /// ends the stream.
    async fn stream(&mut self) -> Result<()> {
        self.set_state(StreamState::Connecting);
        let (mut clients, mut events) = self.connect().await?;
        self.set_state(StreamState::Streaming);

        let merge_usage = D::metrics().is_some();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // set by a reconnect, cleared by the next event or bookmark
        let mut resumed = false;

        loop {
            tokio::select! {
                next = events.next() => {
                    let event = match next {
                        Some(Ok(ApiEvent::Added(o))) => WatchEvent::Added(o),
                        Some(Ok(ApiEvent::Modified(o))) => WatchEvent::Modified(o),
                        Some(Ok(ApiEvent::Deleted(o))) => WatchEvent::Deleted(o),
                        Some(Ok(ApiEvent::Bookmark(bookmark))) => {
                            self.resource_version = bookmark.metadata.resource_version;
                            resumed = false;
                            continue;
                        }
                        Some(Ok(ApiEvent::Error(status))) => {
                            let failure = Error::Kube(kube::Error::Api(status));
                            (clients, events) =
                                self.recover(failure, &clients, &mut resumed).await?;
                            continue;
                        }
                        Some(Err(e)) => {
                            (clients, events) =
                                self.recover(Error::Kube(e), &clients, &mut resumed).await?;
                            continue;
                        }
                        None => {
                            (clients, events) = self.resume(&mut resumed).await?;
                            continue;
                        }
                    };
                    resumed = false;
                    if !self.forward(event).await {
                        return Ok(());
                    }
                }
                _ = ticker.tick(), if merge_usage => {
                    if !self.refresh_usage().await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Reopens a stream the server ended, unless nothing arrived since the
    /// last reopen.
    async fn resume(
        &mut self,
        resumed: &mut bool,
    ) -> Result<(Arc<ClientSet>, EventStream<D::Object>)> {
        if *resumed {
            return Err(Error::WatchClosed(self.scope()));
        }
        *resumed = true;
        self.set_state(StreamState::Reconnecting);
        log::debug!(
            "watch: {} ended by server, resuming at {}",
            self.scope(),
            self.resource_version
        );
        let reopened = self.connect().await?;
        self.set_state(StreamState::Streaming);
        Ok(reopened)
    }

    /// Handles a mid-stream failure: one refresh and one reopen for an
    /// authentication failure, unless the stream was already reopened with
    /// nothing received since.
    async fn recover(
        &mut self,
        failure: Error,
        stale: &ClientSet,
        resumed: &mut bool,
    ) -> Result<(Arc<ClientSet>, EventStream<D::Object>)> {
        if !failure.is_auth_expired() || *resumed {
            return Err(failure);
        }
        *resumed = true;
        self.set_state(StreamState::Reconnecting);
        log::info!(
            "watch: {} lost authentication, reconnecting at {}",
            self.scope(),
            self.resource_version
        );
        let clients = self.gateway.refresh(stale).await?;
        let events = self
            .source
            .open(clients.clone(), self.namespace.clone(), self.resource_version.clone())
            .await?;
        self.set_state(StreamState::Streaming);
        Ok((clients, events))
    }

    async fn deliver(&self, item: Result<WatchEvent<D::Item>>) -> bool {
        self.tx.send(item).await.is_ok()
    }

    async fn forward(&mut self, event: WatchEvent<D::Object>) -> bool {
        let object = event.object();
        if let Some(rv) = object.meta().resource_version.clone() {
            self.resource_version = rv;
        }
        let key = object_key(object);
        let usage = self.usage.get(&key).copied();
        let event = event.map(|o| {
            let mut item = D::list_item(&o);
            if let Some(usage) = usage {
                D::apply_usage(&mut item, usage);
            }
            item
        });

        if D::metrics().is_some() {
            match &event {
                WatchEvent::Deleted(_) => {
                    self.cache.remove(&key);
                }
                WatchEvent::Added(item) | WatchEvent::Modified(item) => {
                    self.cache.insert(key, item.clone());
                }
            }
        }
        self.deliver(Ok(event)).await
    }

    /// Fetches usage and re-emits every cached object as modified.
    ///
    /// Rejected credentials end the stream. Other failures keep the last
    /// snapshot. `Ok(false)` means the subscriber went away.
    async fn refresh_usage(&mut self) -> Result<bool> {
        let Some(kind) = D::metrics() else {
            return Ok(true);
        };
        match self
            .source
            .usage(&self.gateway, kind, self.namespace.as_deref())
            .await
        {
            Ok(usage) => self.usage = usage,
            Err(e) if e.is_auth_expired() => return Err(e),
            Err(e) => {
                log::warn!("watch: {} metrics refresh failed: {e}", self.scope());
                return Ok(true);
            }
        }

        let merged: Vec<D::Item> = self
            .cache
            .iter_mut()
            .map(|(key, item)| {
                if let Some(usage) = self.usage.get(key) {
                    D::apply_usage(item, *usage);
                }
                item.clone()
            })
            .collect();
        for item in merged {
            if !self.deliver(Ok(WatchEvent::Modified(item))).await {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use futures::stream;
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;
    use crate::error::api_error;
    use crate::gateway::testing;
    use crate::metrics::Usage;
    use crate::models::k8s::PodSummary;
    use crate::resources::kinds::PodKind;

    type Script = Result<Vec<kube::Result<ApiEvent<Pod>>>>;

    struct FakeSource {
        scripts: Mutex<VecDeque<Script>>,
        versions: Mutex<Vec<String>>,
        opens: AtomicUsize,
        usage: UsageMap,
        /// Streams end after their script instead of staying open.
        ends: bool,
        usage_failure: Option<u16>,
    }

    impl FakeSource {
        fn scripted(
            scripts: Vec<Script>,
            usage: UsageMap,
            ends: bool,
            usage_failure: Option<u16>,
        ) -> Arc<Self> {
            Arc::new(FakeSource {
                scripts: Mutex::new(scripts.into()),
                versions: Mutex::new(Vec::new()),
                opens: AtomicUsize::new(0),
                usage,
                ends,
                usage_failure,
            })
        }

        fn new(scripts: Vec<Script>, usage: UsageMap) -> Arc<Self> {
            Self::scripted(scripts, usage, false, None)
        }

        /// Usage reads fail too, so ticks never re-emit cached objects.
        fn ending(scripts: Vec<Script>) -> Arc<Self> {
            Self::scripted(scripts, UsageMap::new(), true, Some(503))
        }

        fn failing_usage(scripts: Vec<Script>, code: u16) -> Arc<Self> {
            Self::scripted(scripts, UsageMap::new(), false, Some(code))
        }

        fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }

        fn versions(&self) -> Vec<String> {
            self.versions.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WatchSource<PodKind> for FakeSource {
        async fn open(
            &self,
            _clients: Arc<ClientSet>,
            _namespace: Option<String>,
            resource_version: String,
        ) -> Result<EventStream<Pod>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            self.versions.lock().unwrap().push(resource_version);
            let next = self.scripts.lock().unwrap().pop_front();
            match next {
                Some(Err(e)) => Err(e),
                Some(Ok(events)) if self.ends => Ok(stream::iter(events).boxed()),
                None if self.ends => Ok(stream::empty().boxed()),
                Some(Ok(events)) => Ok(stream::iter(events).chain(stream::pending()).boxed()),
                None => Ok(stream::pending().boxed()),
            }
        }

        async fn usage(
            &self,
            _gateway: &Gateway,
            _kind: MetricsKind,
            _namespace: Option<&str>,
        ) -> Result<UsageMap> {
            match self.usage_failure {
                Some(code) => Err(api_error(code)),
                None => Ok(self.usage.clone()),
            }
        }
    }

    fn pod(name: &str, resource_version: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                resource_version: Some(resource_version.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn status(code: u16) -> kube::core::ErrorResponse {
        match api_error(code) {
            Error::Kube(kube::Error::Api(response)) => response,
            other => panic!("unexpected error {other}"),
        }
    }

    fn unauthorized() -> kube::Error {
        kube::Error::Api(status(401))
    }

    fn manager(gateway: Arc<Gateway>, interval: Duration) -> WatchManager {
        WatchManager {
            gateway,
            interval,
            capacity: 16,
        }
    }

    fn subscribe(watches: &WatchManager, source: Arc<FakeSource>) -> Subscription<PodSummary> {
        watches.subscribe_with::<PodKind>(source, None, &CancellationToken::new())
    }

    async fn next(sub: &mut Subscription<PodSummary>) -> Option<Result<WatchEvent<PodSummary>>> {
        tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .expect("no event within 2s")
    }

    fn name(event: &WatchEvent<PodSummary>) -> &str {
        &event.object().name
    }

    #[tokio::test]
    async fn connect_auth_failure_retries_once_then_surfaces() {
        let (gateway, connector) = testing::gateway(&["prod"]).await;
        let source = FakeSource::new(
            vec![Err(api_error(401)), Err(api_error(401))],
            UsageMap::new(),
        );
        let watches = manager(gateway, Duration::from_secs(3600));

        let mut sub = subscribe(&watches, source.clone());

        let err = next(&mut sub).await.unwrap().unwrap_err();
        assert!(err.is_auth_expired());
        assert!(next(&mut sub).await.is_none());
        assert_eq!(source.opens(), 2);
        assert_eq!(connector.connects(), 2);
        assert_eq!(sub.state(), StreamState::Closed);
    }

    #[tokio::test]
    async fn connect_recovers_after_one_auth_failure() {
        let (gateway, _) = testing::gateway(&["prod"]).await;
        let source = FakeSource::new(
            vec![Err(api_error(401)), Ok(vec![Ok(ApiEvent::Added(pod("a", "3")))])],
            UsageMap::new(),
        );
        let watches = manager(gateway, Duration::from_secs(3600));
        let mut sub = subscribe(&watches, source.clone());

        let event = next(&mut sub).await.unwrap().unwrap();
        assert!(matches!(event, WatchEvent::Added(_)));
        assert_eq!(name(&event), "a");
        assert_eq!(source.opens(), 2);
        assert_eq!(sub.state(), StreamState::Streaming);
    }

    #[tokio::test]
    async fn mid_stream_auth_failure_resumes_from_last_version() {
        let (gateway, connector) = testing::gateway(&["prod"]).await;
        let source = FakeSource::new(
            vec![
                Ok(vec![Ok(ApiEvent::Added(pod("a", "5"))), Err(unauthorized())]),
                Ok(vec![Ok(ApiEvent::Modified(pod("a", "6")))]),
            ],
            UsageMap::new(),
        );
        let watches = manager(gateway, Duration::from_secs(3600));
        let mut sub = subscribe(&watches, source.clone());

        assert!(matches!(next(&mut sub).await, Some(Ok(WatchEvent::Added(_)))));
        assert!(matches!(next(&mut sub).await, Some(Ok(WatchEvent::Modified(_)))));
        assert_eq!(source.versions(), vec!["0".to_string(), "5".to_string()]);
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test]
    async fn consecutive_mid_stream_auth_failures_are_surfaced() {
        let (gateway, connector) = testing::gateway(&["prod"]).await;
        let source = FakeSource::new(
            vec![
                Ok(vec![Ok(ApiEvent::Added(pod("a", "5"))), Err(unauthorized())]),
                Ok(vec![Ok(ApiEvent::Error(status(401)))]),
            ],
            UsageMap::new(),
        );
        let watches = manager(gateway, Duration::from_secs(3600));
        let mut sub = subscribe(&watches, source.clone());

        assert!(matches!(next(&mut sub).await, Some(Ok(WatchEvent::Added(_)))));
        let err = next(&mut sub).await.unwrap().unwrap_err();
        assert!(err.is_auth_expired());
        assert!(next(&mut sub).await.is_none());
        assert_eq!(source.opens(), 2);
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test]
    async fn other_failures_are_surfaced_without_reconnecting() {
        let (gateway, connector) = testing::gateway(&["prod"]).await;
        let source = FakeSource::new(
            vec![Ok(vec![Ok(ApiEvent::Error(status(410)))])],
            UsageMap::new(),
        );
        let watches = manager(gateway, Duration::from_secs(3600));
        let mut sub = subscribe(&watches, source.clone());

        let err = next(&mut sub).await.unwrap().unwrap_err();
        assert!(!err.is_auth_expired());
        assert!(next(&mut sub).await.is_none());
        assert_eq!(source.opens(), 1);
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn cancellation_suppresses_queued_events() {
        let (gateway, _) = testing::gateway(&["prod"]).await;
        let source = FakeSource::new(
            vec![Ok(vec![
                Ok(ApiEvent::Added(pod("a", "1"))),
                Ok(ApiEvent::Added(pod("b", "2"))),
                Ok(ApiEvent::Added(pod("c", "3"))),
            ])],
            UsageMap::new(),
        );
        let watches = manager(gateway, Duration::from_secs(3600));
        let cancel = CancellationToken::new();
        let mut sub = watches.subscribe_with::<PodKind>(source, None, &cancel);

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        assert!(sub.is_cancelled());
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn metrics_refresh_re_emits_cached_objects() {
        let (gateway, _) = testing::gateway(&["prod"]).await;
        let usage: UsageMap = [(
            "default/a".to_string(),
            Usage {
                cpu_millicores: 250.0,
                memory_bytes: 64.0 * 1024.0 * 1024.0,
            },
        )]
        .into();
        let source = FakeSource::new(
            vec![Ok(vec![
                Ok(ApiEvent::Added(pod("a", "1"))),
                Ok(ApiEvent::Added(pod("b", "2"))),
                Ok(ApiEvent::Deleted(pod("b", "3"))),
            ])],
            usage,
        );
        let watches = manager(gateway, Duration::from_millis(50));
        let mut sub = subscribe(&watches, source);

        let mut deleted_b = false;
        loop {
            let event = next(&mut sub).await.unwrap().unwrap();
            match &event {
                WatchEvent::Deleted(item) if item.name == "b" => deleted_b = true,
                WatchEvent::Modified(item) if deleted_b => {
                    assert_eq!(item.name, "a");
                    assert_eq!(item.cpu.as_deref(), Some("250m"));
                    assert_eq!(item.memory.as_deref(), Some("64Mi"));
                    break;
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn server_ends_are_resumed_until_one_brings_nothing() {
        let (gateway, connector) = testing::gateway(&["prod"]).await;
        let source = FakeSource::ending(vec![
            Ok(vec![Ok(ApiEvent::Added(pod("a", "5")))]),
            Ok(vec![Ok(ApiEvent::Modified(pod("a", "6")))]),
            Ok(vec![]),
        ]);
        let watches = manager(gateway, Duration::from_secs(3600));
        let mut sub = subscribe(&watches, source.clone());

        assert!(matches!(next(&mut sub).await, Some(Ok(WatchEvent::Added(_)))));
        assert!(matches!(next(&mut sub).await, Some(Ok(WatchEvent::Modified(_)))));
        let err = next(&mut sub).await.unwrap().unwrap_err();
        assert!(matches!(err, Error::WatchClosed(_)), "{err}");
        assert!(next(&mut sub).await.is_none());

        assert_eq!(source.opens(), 3);
        assert_eq!(
            source.versions(),
            vec!["0".to_string(), "5".to_string(), "6".to_string()]
        );
        assert_eq!(connector.connects(), 1);
        assert_eq!(sub.state(), StreamState::Closed);
    }

    #[tokio::test]
    async fn rejected_usage_credentials_end_the_stream() {
        let (gateway, _) = testing::gateway(&["prod"]).await;
        let source =
            FakeSource::failing_usage(vec![Ok(vec![Ok(ApiEvent::Added(pod("a", "1")))])], 401);
        let watches = manager(gateway, Duration::from_millis(20));
        let mut sub = subscribe(&watches, source);

        let err = loop {
            match next(&mut sub).await {
                Some(Ok(WatchEvent::Added(_))) => continue,
                Some(Err(e)) => break e,
                other => panic!("unexpected {other:?}"),
            }
        };
        assert!(err.is_auth_expired());
        assert!(next(&mut sub).await.is_none());
    }

    #[tokio::test]
    async fn unavailable_usage_keeps_streaming() {
        let (gateway, _) = testing::gateway(&["prod"]).await;
        let source =
            FakeSource::failing_usage(vec![Ok(vec![Ok(ApiEvent::Added(pod("a", "1")))])], 503);
        let watches = manager(gateway, Duration::from_millis(20));
        let mut sub = subscribe(&watches, source);

        assert!(matches!(next(&mut sub).await, Some(Ok(WatchEvent::Added(_)))));
        let quiet = tokio::time::timeout(Duration::from_millis(200), sub.next()).await;
        assert!(quiet.is_err());
        assert_eq!(sub.state(), StreamState::Streaming);
    }

    #[tokio::test]
    async fn cancel_stops_a_supervisor_blocked_on_a_full_channel() {
        let (gateway, _) = testing::gateway(&["prod"]).await;
        // usage never arrives, so nothing but the watch writes to the channel
        let source = FakeSource::failing_usage(
            vec![Ok(vec![
                Ok(ApiEvent::Added(pod("a", "1"))),
                Ok(ApiEvent::Error(status(410))),
            ])],
            503,
        );
        let watches = WatchManager {
            capacity: 1,
            ..manager(gateway, Duration::from_secs(3600))
        };
        let cancel = CancellationToken::new();
        let mut sub = watches.subscribe_with::<PodKind>(source, None, &cancel);

        // "a" fills the channel, the 410 failure has nowhere to go
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(2), sub.closed())
            .await
            .expect("supervisor still running after cancel");
        assert_eq!(sub.state(), StreamState::Closed);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = WatchEvent::Deleted(serde_json::json!({ "name": "a" }));
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({ "type": "DELETED", "object": { "name": "a" } })
        );
    }
}
