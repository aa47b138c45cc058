//! Capability traits at the boundary between the pipeline and its host.
//!
//! A component that feeds the bus implements [`Publishes`], one that reads
//! from it implements [`Consumes`], and anything the host can start and stop
//! implements [`Sensor`]. A component may implement any combination.

use rt_types::{ChannelId, ChannelKey, MeasurementValue};

/// Receives every value published on the channels it subscribed to.
///
/// Called inline on the publisher's thread, in subscription order. Must not
/// block; hand heavy work off to another thread.
pub trait Observer: Send + Sync {
    fn on_value_available(&self, id: ChannelId, value: &MeasurementValue);
}

impl<F> Observer for F
where
    F: Fn(ChannelId, &MeasurementValue) + Send + Sync,
{
    fn on_value_available(&self, id: ChannelId, value: &MeasurementValue) {
        self(id, value)
    }
}

/// A component that provides channels on the bus.
pub trait Publishes {
    fn published_channels(&self) -> Vec<ChannelKey>;
}

/// A component that consumes channels from the bus.
pub trait Consumes: Observer {
    fn consumer_name(&self) -> &str;

    /// Channels to subscribe to when attached.
    fn wanted_channels(&self) -> Vec<ChannelKey>;
}

/// Host-facing lifecycle of an acquisition source.
pub trait Sensor {
    fn name(&self) -> &str;

    /// Starts acquisition. Returns `false` if it could not be started.
    fn start(&self) -> bool;

    /// Stops acquisition. Stopping an idle sensor succeeds.
    fn stop(&self) -> bool;

    /// Whether the sensor has what it needs to start.
    fn is_configured(&self) -> bool;
}
