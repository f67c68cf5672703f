//! Session and credential lifecycle.
//!
//! - `credentials`: durable storage of the token pair and cached profile
//! - `token`: local, unverified inspection of access tokens
//! - `state`: the session state machine and its change stream
//! - `refresh`: single-flight token refresh
//! - `guard`: route admission
//! - `session`: the handle tying it all together

pub mod credentials;
pub mod error;
pub mod guard;
pub mod refresh;
pub mod session;
pub mod state;
pub mod token;

pub use credentials::{
    Credential, CredentialPair, CredentialStore, FileCredentialStore, KeyringCredentialStore,
    MemoryCredentialStore, StoredSession,
};
pub use error::{AuthError, DecodeError, RefreshError, StorageError};
pub use guard::{Access, GuardDecision, Route, RouteAccessGuard, RouteTable};
pub use refresh::RefreshCoordinator;
pub use session::SessionManager;
pub use state::{AuthStateMachine, AuthenticatedSession, SessionState, SessionStatus};
pub use token::{BearerToken, Claims, TokenCodec};
// Token values are read through this trait
pub use secrecy::ExposeSecret;
