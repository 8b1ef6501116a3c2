//! JSON wire protocol.
//!
//! One JSON object per WebSocket text message, discriminated by a `type`
//! field. Inbound and outbound messages are closed tagged enums so dispatch
//! is exhaustive; anything that does not parse is dropped by the caller.

use serde::{Deserialize, Serialize};

/// Message sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Submit a human-verification token for the external check.
    VerifyCaptcha {
        /// Opaque token issued by the captcha widget.
        token: String,
    },
    /// Enter the matchmaking queue.
    FindPartner,
    /// Skip the current partner and look for a new one.
    Next,
    /// Text line for the current partner.
    Chat {
        /// Message body, relayed verbatim.
        text: String,
    },
    /// Ask the partner for consent to exchange photos.
    RequestPhoto,
    /// Answer a photo-consent request.
    ResponsePhoto {
        /// Whether the consent request was accepted.
        accepted: bool,
    },
    /// Photo payload, opaque to the server.
    PhotoData {
        /// Base64-encoded image data.
        image: String,
    },
}

/// Message sent from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Human verification accepted; the session may now use the relay.
    CaptchaSuccess,
    /// Now waiting in the matchmaking queue.
    Queued,
    /// Paired with a partner.
    Matched {
        /// Identifier of the newly created room.
        #[serde(rename = "roomId")]
        room_id: String,
    },
    /// Text line relayed from the partner.
    Chat {
        /// Message body, relayed verbatim.
        text: String,
    },
    /// The partner skipped; the room is gone.
    Ended,
    /// The partner disconnected; the room is gone.
    PartnerLeft,
    /// The partner asks for consent to exchange photos.
    RequestPhoto,
    /// The partner's answer to a photo-consent request.
    ResponsePhoto {
        /// Whether the consent request was accepted.
        accepted: bool,
    },
    /// Photo payload relayed from the partner.
    PhotoData {
        /// Base64-encoded image data.
        image: String,
    },
    /// Non-fatal (except verification) protocol or policy error.
    Error {
        /// What went wrong.
        reason: ErrorReason,
    },
}

/// Error reasons surfaced to the client.
///
/// Only `VerificationFailed` closes the connection; everything else leaves
/// it open and the client may retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    /// Chat or photo action with no active room.
    NotPaired,
    /// Stale room reference; the room was destroyed while the message was
    /// in flight.
    RoomMissing,
    /// Over the sliding-window message budget.
    RateLimit,
    /// The external human-verification check rejected the token.
    VerificationFailed,
    /// The external verification collaborator was unreachable or errored.
    ServerError,
}
