//! Measurement bus: a typed registry of channels with ordered subscribers.
//!
//! Every channel is keyed by its kind and id. Publishing stores the value as
//! the channel's current value, appends it to a bounded history and then
//! notifies each subscriber synchronously, in the order they subscribed. The
//! registry lock is released before any observer runs, so observers may call
//! back into the bus.

use rt_types::{
    ChannelId, ChannelKey, ChannelKind, ChannelMeta, DeviceInfo, MeasurementValue,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::plugin::{Consumes, Observer};

/// Handle returned by [`MeasurementBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    observer: Arc<dyn Observer>,
}

struct Channel {
    meta: ChannelMeta,
    /// Fixed column length of a multi-sample array.
    num_channels: Option<usize>,
    current: Option<MeasurementValue>,
    history: VecDeque<MeasurementValue>,
    history_len: usize,
    subscribers: Vec<Subscriber>,
}

impl Channel {
    fn new(kind: ChannelKind, meta: ChannelMeta) -> Self {
        Self {
            meta,
            num_channels: None,
            current: None,
            history: VecDeque::new(),
            history_len: kind.default_history_len(),
            subscribers: Vec::new(),
        }
    }

    fn validate(&self, key: ChannelKey, value: &MeasurementValue) -> PipelineResult<()> {
        if value.kind() != key.kind {
            return Err(PipelineError::KindMismatch {
                key,
                actual: value.kind(),
            });
        }
        match value {
            MeasurementValue::MultiSample(column) => {
                let expected = self.num_channels.unwrap_or(0);
                if column.len() != expected {
                    return Err(PipelineError::InvalidValue {
                        key,
                        message: format!("{} values for {} channels", column.len(), expected),
                    });
                }
            }
            MeasurementValue::Progress(percent) if *percent > 100 => {
                return Err(PipelineError::InvalidValue {
                    key,
                    message: format!("progress of {}%", percent),
                });
            }
            _ => {}
        }
        Ok(())
    }

    fn record(&mut self, value: MeasurementValue) {
        self.history.push_back(value.clone());
        while self.history.len() > self.history_len {
            self.history.pop_front();
        }
        self.current = Some(value);
    }
}

/// Counters describing bus activity since creation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BusMetrics {
    /// Values accepted and stored
    pub values_published: u64,
    /// Observer notifications made
    pub notifications_delivered: u64,
    /// Values rejected by validation or published to a missing channel
    pub values_dropped: u64,
    pub channels: usize,
    pub subscribers: usize,
}

/// Forwards notifications to a [`Consumes`] implementor.
struct ConsumerObserver(Arc<dyn Consumes>);

impl Observer for ConsumerObserver {
    fn on_value_available(&self, id: ChannelId, value: &MeasurementValue) {
        self.0.on_value_available(id, value)
    }
}

pub struct MeasurementBus {
    channels: RwLock<HashMap<ChannelKey, Channel>>,
    next_subscription: AtomicU64,
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Default for MeasurementBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MeasurementBus {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ChannelKey, Channel>> {
        self.channels.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ChannelKey, Channel>> {
        self.channels.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn insert(&self, key: ChannelKey, channel: Channel) -> PipelineResult<ChannelKey> {
        let mut channels = self.write();
        if channels.contains_key(&key) {
            warn!(channel = %key, "Duplicate channel registration rejected");
            return Err(PipelineError::DuplicateChannel { key });
        }
        channels.insert(key, channel);
        debug!(channel = %key, "Channel created");
        Ok(key)
    }

    /// Registers a channel of any kind except [`ChannelKind::MultiSampleArray`],
    /// which needs a channel count; see [`create_multi_sample_array`](Self::create_multi_sample_array).
    pub fn create_channel(
        &self,
        kind: ChannelKind,
        id: ChannelId,
        name: &str,
        unit: &str,
    ) -> PipelineResult<ChannelKey> {
        if kind == ChannelKind::MultiSampleArray {
            return Err(PipelineError::invalid_configuration(
                "multi-sample arrays need a channel count",
            ));
        }
        self.insert(ChannelKey::new(kind, id), Channel::new(kind, ChannelMeta::new(name, unit)))
    }

    /// Registers a multi-sample array whose columns hold `num_channels` values.
    pub fn create_multi_sample_array(
        &self,
        id: ChannelId,
        num_channels: usize,
        name: &str,
        unit: &str,
    ) -> PipelineResult<ChannelKey> {
        if num_channels == 0 {
            return Err(PipelineError::invalid_configuration(
                "a multi-sample array needs at least one channel",
            ));
        }
        let kind = ChannelKind::MultiSampleArray;
        let mut channel = Channel::new(kind, ChannelMeta::new(name, unit));
        channel.num_channels = Some(num_channels);
        self.insert(ChannelKey::new(kind, id), channel)
    }

    pub fn contains(&self, key: ChannelKey) -> bool {
        self.read().contains_key(&key)
    }

    pub fn subscribe(&self, key: ChannelKey, observer: Arc<dyn Observer>) -> PipelineResult<SubscriptionId> {
        let mut channels = self.write();
        let channel = channels
            .get_mut(&key)
            .ok_or(PipelineError::UnknownChannel { key })?;
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        channel.subscribers.push(Subscriber { id, observer });
        debug!(channel = %key, subscription = id.0, "Subscriber registered");
        Ok(id)
    }

    /// Removes a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, key: ChannelKey, subscription: SubscriptionId) -> bool {
        let mut channels = self.write();
        let Some(channel) = channels.get_mut(&key) else {
            return false;
        };
        let before = channel.subscribers.len();
        channel.subscribers.retain(|s| s.id != subscription);
        before != channel.subscribers.len()
    }

    pub fn subscriber_count(&self, key: ChannelKey) -> usize {
        self.read().get(&key).map_or(0, |c| c.subscribers.len())
    }

    /// Subscribes a consumer to each channel it wants that currently exists.
    pub fn attach(&self, consumer: Arc<dyn Consumes>) -> Vec<(ChannelKey, SubscriptionId)> {
        let observer: Arc<dyn Observer> = Arc::new(ConsumerObserver(consumer.clone()));
        let mut attached = Vec::new();
        for key in consumer.wanted_channels() {
            match self.subscribe(key, observer.clone()) {
                Ok(subscription) => attached.push((key, subscription)),
                Err(_) => debug!(
                    consumer = consumer.consumer_name(),
                    channel = %key,
                    "Wanted channel does not exist, skipped"
                ),
            }
        }
        info!(
            consumer = consumer.consumer_name(),
            channels = attached.len(),
            "Consumer attached"
        );
        attached
    }

    /// Publishes one value and returns how many observers were notified.
    ///
    /// A value that fails validation is counted as dropped and never reaches
    /// an observer.
    pub fn publish(&self, key: ChannelKey, value: MeasurementValue) -> PipelineResult<usize> {
        let observers: Vec<Arc<dyn Observer>> = {
            let mut channels = self.write();
            let checked = match channels.get_mut(&key) {
                Some(channel) => channel.validate(key, &value).map(|_| channel),
                None => Err(PipelineError::UnknownChannel { key }),
            };
            let channel = match checked {
                Ok(channel) => channel,
                Err(e) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(channel = %key, error = %e, "Value dropped");
                    return Err(e);
                }
            };
            channel.record(value.clone());
            channel.subscribers.iter().map(|s| s.observer.clone()).collect()
        };

        self.published.fetch_add(1, Ordering::Relaxed);
        for observer in &observers {
            observer.on_value_available(key.id, &value);
        }
        self.delivered.fetch_add(observers.len() as u64, Ordering::Relaxed);
        Ok(observers.len())
    }

    /// Metadata of the channel with this id; the first kind in
    /// [`ChannelKind::ALL`] order wins when several kinds share the id.
    pub fn metadata(&self, id: ChannelId) -> Option<ChannelMeta> {
        let channels = self.read();
        ChannelKind::ALL
            .iter()
            .find_map(|&kind| channels.get(&ChannelKey::new(kind, id)))
            .map(|c| c.meta.clone())
    }

    pub fn metadata_for(&self, key: ChannelKey) -> Option<ChannelMeta> {
        self.read().get(&key).map(|c| c.meta.clone())
    }

    /// Sets the visibility hint on every channel with this id.
    pub fn set_visibility(&self, id: ChannelId, visible: bool) -> bool {
        let mut found = false;
        for (key, channel) in self.write().iter_mut() {
            if key.id == id {
                channel.meta.visible = visible;
                found = true;
            }
        }
        found
    }

    /// Reshapes a multi-sample array for a new acquisition epoch.
    ///
    /// Subscribers are kept; the current value and history are cleared since
    /// their columns no longer match.
    pub fn init_from_device_info(&self, key: ChannelKey, info: &DeviceInfo) -> PipelineResult<()> {
        if key.kind != ChannelKind::MultiSampleArray {
            return Err(PipelineError::KindMismatch {
                key,
                actual: ChannelKind::MultiSampleArray,
            });
        }
        info.validate()?;
        let mut channels = self.write();
        let channel = channels
            .get_mut(&key)
            .ok_or(PipelineError::UnknownChannel { key })?;
        channel.num_channels = Some(info.num_channels);
        channel.meta.channel_names = (0..info.num_channels).map(|i| info.channel_name(i)).collect();
        channel.meta.channel_units = (0..info.num_channels).map(|i| info.channel_unit(i)).collect();
        channel.meta.sampling_rate = Some(info.sampling_rate);
        channel.current = None;
        channel.history.clear();
        info!(
            channel = %key,
            num_channels = info.num_channels,
            sampling_rate = info.sampling_rate,
            "Channel initialised from device info"
        );
        Ok(())
    }

    pub fn num_channels(&self, key: ChannelKey) -> Option<usize> {
        self.read().get(&key).and_then(|c| c.num_channels)
    }

    pub fn current_value(&self, key: ChannelKey) -> Option<MeasurementValue> {
        self.read().get(&key).and_then(|c| c.current.clone())
    }

    /// Recent values, oldest first.
    pub fn history(&self, key: ChannelKey) -> Vec<MeasurementValue> {
        self.read()
            .get(&key)
            .map(|c| c.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn set_history_len(&self, key: ChannelKey, len: usize) -> PipelineResult<()> {
        if len == 0 {
            return Err(PipelineError::invalid_configuration("history length must be greater than 0"));
        }
        let mut channels = self.write();
        let channel = channels
            .get_mut(&key)
            .ok_or(PipelineError::UnknownChannel { key })?;
        channel.history_len = len;
        while channel.history.len() > len {
            channel.history.pop_front();
        }
        Ok(())
    }

    pub fn channel_ids(&self, kind: ChannelKind) -> Vec<ChannelId> {
        let mut ids: Vec<ChannelId> = self
            .read()
            .keys()
            .filter(|key| key.kind == kind)
            .map(|key| key.id)
            .collect();
        ids.sort();
        ids
    }

    pub fn channel_keys(&self) -> Vec<ChannelKey> {
        let mut keys: Vec<ChannelKey> = self.read().keys().copied().collect();
        keys.sort();
        keys
    }

    pub fn metrics(&self) -> BusMetrics {
        let channels = self.read();
        BusMetrics {
            values_published: self.published.load(Ordering::Relaxed),
            notifications_delivered: self.delivered.load(Ordering::Relaxed),
            values_dropped: self.dropped.load(Ordering::Relaxed),
            channels: channels.len(),
            subscribers: channels.values().map(|c| c.subscribers.len()).sum(),
        }
    }

    /// Drops every channel and subscription.
    pub fn reset(&self) {
        let mut channels = self.write();
        let count = channels.len();
        channels.clear();
        debug!(channels = count, "Measurement bus reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rt_types::SourceEstimate;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<(usize, ChannelId, MeasurementValue)>>>;

    fn recorder(tag: usize, log: &Log) -> Arc<dyn Observer> {
        let log = log.clone();
        Arc::new(move |id: ChannelId, value: &MeasurementValue| {
            log.lock().unwrap().push((tag, id, value.clone()));
        })
    }

    #[test]
    fn test_duplicate_registration_keeps_first_channel() {
        let bus = MeasurementBus::new();
        let log: Log = Arc::default();
        let key = bus
            .create_channel(ChannelKind::Numeric, ChannelId::RT_SERVER_CONNECTED, "connected", "")
            .unwrap();
        bus.subscribe(key, recorder(0, &log)).unwrap();

        let err = bus
            .create_channel(ChannelKind::Numeric, ChannelId::RT_SERVER_CONNECTED, "other", "V")
            .unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateChannel { key: k } if k == key));

        assert_eq!(bus.metadata(ChannelId::RT_SERVER_CONNECTED).unwrap().name, "connected");
        assert_eq!(bus.subscriber_count(key), 1);
        bus.publish(key, MeasurementValue::Numeric(1.0)).unwrap();
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_same_id_different_kinds_coexist() {
        let bus = MeasurementBus::new();
        let id = ChannelId::new(7);
        bus.create_channel(ChannelKind::Numeric, id, "n", "").unwrap();
        bus.create_channel(ChannelKind::Text, id, "t", "").unwrap();
        bus.create_multi_sample_array(id, 2, "m", "V").unwrap();
        assert_eq!(bus.channel_keys().len(), 3);
        assert_eq!(bus.channel_ids(ChannelKind::Text), vec![id]);
        assert_eq!(bus.metadata(id).unwrap().name, "n");
    }

    #[test]
    fn test_sample_and_source_estimate_channels() {
        let bus = MeasurementBus::new();
        let log: Log = Arc::default();
        let id = ChannelId::new(11);
        let sample = bus.create_channel(ChannelKind::SampleArray, id, "trigger", "V").unwrap();
        let estimate = bus
            .create_channel(ChannelKind::SourceEstimate, id, "sources", "Am")
            .unwrap();
        assert!(bus.contains(sample) && bus.contains(estimate));
        for tag in 0..2 {
            bus.subscribe(sample, recorder(tag, &log)).unwrap();
        }
        bus.subscribe(estimate, recorder(2, &log)).unwrap();

        assert_eq!(bus.publish(sample, MeasurementValue::Sample(0.5)).unwrap(), 2);
        let stc = Arc::new(SourceEstimate::new(vec![1.0, 2.0, 3.0, 4.0], 2, 2, vec![10, 20], 0.0, 0.001).unwrap());
        assert_eq!(
            bus.publish(estimate, MeasurementValue::SourceEstimate(stc.clone())).unwrap(),
            1
        );

        {
            let log = log.lock().unwrap();
            let tags: Vec<usize> = log.iter().map(|(tag, _, _)| *tag).collect();
            assert_eq!(tags, vec![0, 1, 2]);
            assert!(log.iter().all(|(_, logged_id, _)| *logged_id == id));
            assert_eq!(log[1].2, MeasurementValue::Sample(0.5));
        }
        assert_eq!(bus.current_value(sample), Some(MeasurementValue::Sample(0.5)));
        match bus.current_value(estimate) {
            Some(MeasurementValue::SourceEstimate(current)) => {
                assert!(Arc::ptr_eq(&current, &stc));
                assert_eq!(current.rows(), 2);
            }
            other => panic!("unexpected current value {:?}", other),
        }

        let err = bus.publish(sample, MeasurementValue::Numeric(1.0)).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::KindMismatch { key, actual: ChannelKind::Numeric } if key == sample
        ));
        let err = bus
            .publish(estimate, MeasurementValue::Sample(1.0))
            .unwrap_err();
        assert!(matches!(err, PipelineError::KindMismatch { .. }));
        assert_eq!(log.lock().unwrap().len(), 3);
        assert_eq!(bus.current_value(sample), Some(MeasurementValue::Sample(0.5)));
        assert_eq!(bus.metrics().values_dropped, 2);
    }

    #[test]
    fn test_fan_out_in_subscription_order() {
        let bus = MeasurementBus::new();
        let log: Log = Arc::default();
        let key = bus
            .create_multi_sample_array(ChannelId::RT_SERVER_OUTPUT, 3, "output", "T")
            .unwrap();
        for tag in 0..4 {
            bus.subscribe(key, recorder(tag, &log)).unwrap();
        }

        let column: Arc<[f64]> = vec![1.0, 2.0, 3.0].into();
        let notified = bus.publish(key, MeasurementValue::MultiSample(column.clone())).unwrap();
        assert_eq!(notified, 4);

        let log = log.lock().unwrap();
        let tags: Vec<usize> = log.iter().map(|(tag, _, _)| *tag).collect();
        assert_eq!(tags, vec![0, 1, 2, 3]);
        for (_, id, value) in log.iter() {
            assert_eq!(*id, ChannelId::RT_SERVER_OUTPUT);
            assert_eq!(value.as_multi_sample(), Some(&column[..]));
        }
    }

    #[test]
    fn test_invalid_values_never_reach_observers() {
        let bus = MeasurementBus::new();
        let log: Log = Arc::default();
        let output = bus
            .create_multi_sample_array(ChannelId::RT_SERVER_OUTPUT, 3, "output", "T")
            .unwrap();
        let fill = bus
            .create_channel(ChannelKind::ProgressBar, ChannelId::RT_SERVER_BUFFER_FILL, "fill", "%")
            .unwrap();
        bus.subscribe(output, recorder(0, &log)).unwrap();
        bus.subscribe(fill, recorder(1, &log)).unwrap();

        let short: Arc<[f64]> = vec![1.0].into();
        assert!(matches!(
            bus.publish(output, MeasurementValue::MultiSample(short)),
            Err(PipelineError::InvalidValue { .. })
        ));
        assert!(matches!(
            bus.publish(output, MeasurementValue::Numeric(1.0)),
            Err(PipelineError::KindMismatch { .. })
        ));
        assert!(bus.publish(fill, MeasurementValue::Progress(101)).is_err());
        let missing = ChannelKey::new(ChannelKind::Text, ChannelId::new(99));
        assert!(matches!(
            bus.publish(missing, MeasurementValue::Text("x".into())),
            Err(PipelineError::UnknownChannel { .. })
        ));

        assert!(log.lock().unwrap().is_empty());
        assert_eq!(bus.current_value(output), None);
        let metrics = bus.metrics();
        assert_eq!(metrics.values_dropped, 4);
        assert_eq!(metrics.values_published, 0);
        assert_eq!(metrics.subscribers, 2);
    }

    #[test]
    fn test_history_is_bounded() {
        let bus = MeasurementBus::new();
        let key = bus
            .create_channel(ChannelKind::Numeric, ChannelId::new(5), "n", "")
            .unwrap();
        bus.set_history_len(key, 3).unwrap();
        for i in 0..5 {
            bus.publish(key, MeasurementValue::Numeric(i as f64)).unwrap();
        }
        let history: Vec<f64> = bus.history(key).iter().filter_map(|v| v.as_numeric()).collect();
        assert_eq!(history, vec![2.0, 3.0, 4.0]);
        assert_eq!(bus.current_value(key), Some(MeasurementValue::Numeric(4.0)));
        assert!(bus.set_history_len(key, 0).is_err());
    }

    #[test]
    fn test_unsubscribe_and_reentrant_observer() {
        let bus = Arc::new(MeasurementBus::new());
        let key = bus
            .create_channel(ChannelKind::Text, ChannelId::RT_SERVER_MESSAGES, "messages", "")
            .unwrap();

        // An observer that reads the bus from inside the notification.
        let seen = Arc::new(Mutex::new(Vec::new()));
        let observer: Arc<dyn Observer> = {
            let bus = bus.clone();
            let seen = seen.clone();
            Arc::new(move |_: ChannelId, _: &MeasurementValue| {
                seen.lock().unwrap().push(bus.current_value(key));
            })
        };
        let subscription = bus.subscribe(key, observer).unwrap();
        bus.publish(key, MeasurementValue::Text("hello".into())).unwrap();
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[Some(MeasurementValue::Text("hello".into()))]
        );

        assert!(bus.unsubscribe(key, subscription));
        assert!(!bus.unsubscribe(key, subscription));
        assert_eq!(bus.publish(key, MeasurementValue::Text("again".into())).unwrap(), 0);
    }

    #[test]
    fn test_init_from_device_info_reshapes_and_keeps_subscribers() {
        let bus = MeasurementBus::new();
        let log: Log = Arc::default();
        let key = bus
            .create_multi_sample_array(ChannelId::RT_SERVER_OUTPUT, 4, "output", "T")
            .unwrap();
        bus.subscribe(key, recorder(0, &log)).unwrap();
        bus.publish(key, MeasurementValue::MultiSample(vec![0.0; 4].into())).unwrap();

        let mut info = DeviceInfo::new(6, 2000.0);
        info.channel_names = (0..6).map(|i| format!("B{}", i)).collect();
        bus.init_from_device_info(key, &info).unwrap();

        assert_eq!(bus.num_channels(key), Some(6));
        assert!(bus.history(key).is_empty());
        let meta = bus.metadata_for(key).unwrap();
        assert_eq!(meta.channel_names.len(), 6);
        assert_eq!(meta.sampling_rate, Some(2000.0));
        assert!(bus.publish(key, MeasurementValue::MultiSample(vec![0.0; 4].into())).is_err());
        assert_eq!(bus.publish(key, MeasurementValue::MultiSample(vec![0.0; 6].into())).unwrap(), 1);

        let numeric = bus.create_channel(ChannelKind::Numeric, ChannelId::new(9), "n", "").unwrap();
        assert!(bus.init_from_device_info(numeric, &info).is_err());
    }

    #[test]
    fn test_visibility_and_reset() {
        let bus = MeasurementBus::new();
        assert!(!bus.set_visibility(ChannelId::RT_SERVER_OUTPUT, true));
        bus.create_multi_sample_array(ChannelId::RT_SERVER_OUTPUT, 2, "output", "T")
            .unwrap();
        assert!(bus.set_visibility(ChannelId::RT_SERVER_OUTPUT, true));
        assert!(bus.metadata(ChannelId::RT_SERVER_OUTPUT).unwrap().visible);

        bus.reset();
        assert!(bus.channel_keys().is_empty());
        assert!(bus.metadata(ChannelId::RT_SERVER_OUTPUT).is_none());
        bus.reset();
    }

    struct Counter {
        count: Mutex<usize>,
    }

    impl Observer for Counter {
        fn on_value_available(&self, _: ChannelId, _: &MeasurementValue) {
            *self.count.lock().unwrap() += 1;
        }
    }

    impl Consumes for Counter {
        fn consumer_name(&self) -> &str {
            "counter"
        }

        fn wanted_channels(&self) -> Vec<ChannelKey> {
            vec![
                ChannelKey::new(ChannelKind::Numeric, ChannelId::RT_SERVER_CONNECTED),
                ChannelKey::new(ChannelKind::Text, ChannelId::RT_SERVER_MESSAGES),
            ]
        }
    }

    #[test]
    fn test_attach_consumer_to_existing_channels() {
        let bus = MeasurementBus::new();
        let connected = bus
            .create_channel(ChannelKind::Numeric, ChannelId::RT_SERVER_CONNECTED, "connected", "")
            .unwrap();
        let counter = Arc::new(Counter { count: Mutex::new(0) });

        let attached = bus.attach(counter.clone());
        assert_eq!(attached.len(), 1);
        bus.publish(connected, MeasurementValue::Numeric(1.0)).unwrap();
        assert_eq!(*counter.count.lock().unwrap(), 1);
    }
}
