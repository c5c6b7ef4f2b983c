/// The key for the Outpost context ID that is used as a correlation ID
/// across async boundaries where broker trace IDs can not be propagated.
/// For example, when an event crosses the publish queue and is fanned out
/// to the delivery queue, the broker does not carry trace headers between
/// the two hops. The Outpost context ID is embedded in message attributes
/// and is used to correlate the publisher and consumer spans.
pub const OUTPOST_CONTEXT_ID_KEY: &str = "outpost.context-id";

/// The key under which a W3C traceparent value is propagated in message
/// attributes when the broker supports custom attributes.
pub const TRACEPARENT_KEY: &str = "traceparent";
