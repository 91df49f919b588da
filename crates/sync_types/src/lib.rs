//! Wire types shared between the sync client and server: entity references,
//! the `Update` encoding, protocol messages, JSON Pointer helpers, and the
//! reconnect backoff policy.
pub mod backoff;
pub mod ids;
pub mod messages;
pub mod path;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod update;

pub use ids::{
    ClientId,
    EntityRef,
    MessageId,
    SubscriptionId,
};
pub use messages::{
    ClientMessage,
    ErrorPayload,
    FieldSelector,
    ReconnectResult,
    ReconnectSubscriptionRequest,
    Select,
    SelectNode,
    ServerMessage,
    PROTOCOL_VERSION,
};
pub use update::{
    ArrayDiffOp,
    DeltaOp,
    Update,
};
