pub mod pkce;
pub mod providers;
pub mod renewer;
pub mod session;
pub mod store;
pub mod token;

pub use providers::{
    IdentityProvider, KeycloakProvider, LoginOutcome, LoginRedirect, LoginRequest, RenewOutcome,
};
pub use renewer::{CredentialRenewer, RenewalHandle, RenewalPolicy, TickOutcome};
pub use session::{InitOutcome, SessionInitializer};
pub use store::{CredentialSnapshot, CredentialStore};
pub use token::{Authorization, Credential, SessionState};
