//! `snipstash-auth` — credential issuance, verification and session lifecycle.
//!
//! This crate is intentionally decoupled from HTTP and storage: persistence,
//! password storage and job dispatch are reached through the traits in
//! [`store`], [`password`] and [`notify`].

pub mod codec;
pub mod context;
pub mod error;
pub mod maker;
pub mod notify;
pub mod password;
pub mod payload;
pub mod principal;
pub mod service;
pub mod session;
pub mod store;

pub use codec::{CredentialCodec, KEY_SIZE};
pub use context::RequestContext;
pub use error::{AuthError, TokenError};
pub use maker::{PasetoMaker, TokenMaker};
pub use notify::{DispatchError, NotificationDispatcher};
pub use password::{Argon2Hasher, PasswordError, PasswordHasher};
pub use payload::Payload;
pub use principal::{NewPrincipal, Principal, PrincipalProfile, PrincipalUpdate};
pub use service::{
    AuthConfig, AuthService, CreateUserRequest, LoginResponse, RenewAccessTokenResponse,
    UpdateUserRequest,
};
pub use session::{ClientMetadata, NewSession, Session};
pub use store::{ConstraintKind, ConstraintViolation, PrincipalStore, SessionStore, StoreError};
