use crate::events::EventSender;
use crate::media::VoiceHandle;
use crate::models::{Identity, MemberProfile};

/// Context shared by the API routes and the WebSocket event stream.
#[derive(Clone)]
pub struct ServiceContext {
    pub identity: Identity,
    /// Profile published on join unless the request overrides it.
    pub profile: MemberProfile,
    pub voice: VoiceHandle,
    pub event_tx: EventSender,
}
