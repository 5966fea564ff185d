use super::client::ChatConnection;
use super::types::UserId;

/// The initial state of the client: no user, no connection.
#[non_exhaustive]
#[derive(Clone, Debug)]
pub struct Anonymous;

/// A user is signed in and owns a live chat session.
///
/// Dropping this state (or the client holding it) disposes the session.
#[non_exhaustive]
pub struct Identified {
    /// The user the session endpoint is parameterised with
    pub(crate) user_id: UserId,
    /// Connection manager for this user's session
    pub(crate) connection: ChatConnection,
}

impl std::fmt::Debug for Identified {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identified")
            .field("user_id", &self.user_id)
            .field("state", &self.connection.state())
            .finish()
    }
}

/// The chat client state can only be [`Anonymous`] or [`Identified`].
pub trait State: sealed::Sealed {}

impl State for Anonymous {}
impl sealed::Sealed for Anonymous {}

impl State for Identified {}
impl sealed::Sealed for Identified {}

mod sealed {
    pub trait Sealed {}
}
