//! Room membership view.
//!
//! [`reduce`] folds relay events into the participant list a client shows.
//! It is pure: the same events in the same order always give the same view.
//!
//! - a `joined` snapshot replaces the whole view, so replaying one after a
//!   reconnect cannot duplicate anybody
//! - updates for somebody not in the view are dropped rather than
//!   re-creating them
//! - events for any room other than the one last joined are ignored

use common::types::{RoomSlug, UserId};
use signaling_protocol::{ParticipantSnapshot, ServerEvent};
use std::collections::BTreeMap;

/// Who is in the room, as seen by the local client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipView {
    pub room: Option<RoomSlug>,
    pub local: Option<ParticipantSnapshot>,
    /// Remote participants only.
    pub participants: BTreeMap<UserId, ParticipantSnapshot>,
}

impl MembershipView {
    #[must_use]
    pub fn local_id(&self) -> Option<&UserId> {
        self.local.as_ref().map(|local| &local.user_id)
    }

    #[must_use]
    pub fn contains(&self, user_id: &UserId) -> bool {
        self.participants.contains_key(user_id)
    }

    #[must_use]
    pub fn host(&self) -> Option<&ParticipantSnapshot> {
        self.local
            .iter()
            .chain(self.participants.values())
            .find(|participant| participant.is_host)
    }

    fn is_local(&self, user_id: &UserId) -> bool {
        self.local_id() == Some(user_id)
    }
}

/// Apply one relay event to the view.
#[must_use]
pub fn reduce(mut view: MembershipView, event: &ServerEvent) -> MembershipView {
    if let ServerEvent::Joined {
        room,
        local,
        participants,
    } = event
    {
        return MembershipView {
            room: Some(room.clone()),
            local: Some(local.clone()),
            participants: participants
                .iter()
                .filter(|participant| participant.user_id != local.user_id)
                .map(|participant| (participant.user_id.clone(), participant.clone()))
                .collect(),
        };
    }

    match (view.room.as_ref(), event.room()) {
        (Some(current), Some(room)) if current == room => {}
        _ => return view,
    }

    match event {
        ServerEvent::UserJoined { participant, .. } => {
            if !view.is_local(&participant.user_id) {
                view.participants
                    .insert(participant.user_id.clone(), participant.clone());
            }
        }
        ServerEvent::UserLeft { user_id, .. } => {
            view.participants.remove(user_id);
        }
        ServerEvent::ControlChanged { user_id, flags, .. } => {
            if view.is_local(user_id) {
                if let Some(local) = view.local.as_mut() {
                    local.set_flags(*flags);
                }
            } else if let Some(participant) = view.participants.get_mut(user_id) {
                participant.set_flags(*flags);
            }
        }
        ServerEvent::HostChanged { new_host_id, .. } => {
            if let Some(local) = view.local.as_mut() {
                local.is_host = local.user_id == *new_host_id;
            }
            for participant in view.participants.values_mut() {
                participant.is_host = participant.user_id == *new_host_id;
            }
        }
        ServerEvent::Kicked { .. } => return MembershipView::default(),
        _ => {}
    }

    view
}
