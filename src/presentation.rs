//! Where remote participants show up for the local user.

use tracing::{error, info, warn};

use crate::PeerId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserNotice {
    RoomFull,
    MediaUnavailable(String),
    /// A per-peer failure worth telling the user about; the call goes on.
    PeerProblem { peer_id: PeerId, message: String },
}

pub trait Presenter: Send + Sync {
    /// A remote track arrived. `mute_control` is true only for the room admin.
    fn show_participant(&self, peer_id: &str, mute_control: bool);
    fn release(&self, peer_id: &str);
    fn notify(&self, notice: UserNotice);
}

/// Renders participants to the log.
#[derive(Debug, Default)]
pub struct LogPresenter;

impl Presenter for LogPresenter {
    fn show_participant(&self, peer_id: &str, mute_control: bool) {
        if mute_control {
            info!("Participant {} joined the call (type `mute {}` to mute them)", peer_id, peer_id);
        } else {
            info!("Participant {} joined the call", peer_id);
        }
    }

    fn release(&self, peer_id: &str) {
        info!("Participant {} left the call", peer_id);
    }

    fn notify(&self, notice: UserNotice) {
        match notice {
            UserNotice::RoomFull => error!("The room is full"),
            UserNotice::MediaUnavailable(reason) => {
                error!("Could not access the microphone: {}", reason)
            }
            UserNotice::PeerProblem { peer_id, message } => {
                warn!("Problem with participant {}: {}", peer_id, message)
            }
        }
    }
}
