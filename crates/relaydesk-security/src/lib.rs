pub mod signature;
pub mod token;
pub mod validation;

pub use signature::{hub_signature, secrets_match, verify_hub_signature};
pub use token::{Claims, TokenVerifier, generate_secret};
pub use validation::InputValidator;
