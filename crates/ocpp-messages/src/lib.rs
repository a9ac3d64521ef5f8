//! # OCPP Messages
//!
//! Typed OCPP 1.6J payloads, the frame serializer and the payload schema validator.

pub mod serialization;
pub mod v16j;
pub mod validation;

pub use ocpp_types::{CallErrorMessage, CallMessage, CallResultMessage, Message, MessageType};
pub use serialization::MessageSerializer;
pub use validation::{Direction, SchemaValidator, Validate};

use serde::{Deserialize, Serialize};

/// A typed OCPP payload bound to its action name.
pub trait OcppAction: Serialize + for<'de> Deserialize<'de> + Send + Sync {
    /// Action name as it appears in the Call frame.
    const ACTION_NAME: &'static str;
    /// Payload of the matching CallResult.
    type Response: OcppAction;
}

/// Marker for CallResult payloads.
pub trait OcppResponse: OcppAction {}
