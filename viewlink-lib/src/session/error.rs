use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no peer session exists yet")]
    NoPeerSession,
    #[error("a peer session already exists")]
    PeerSessionExists,
    #[error("remote description has not been applied yet")]
    MissingRemoteDescription,
}
