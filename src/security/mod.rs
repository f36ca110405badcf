// Secret handling for notification channel credentials

pub mod encryption;

pub use encryption::{SecretCipher, MASTER_KEY_LEN};
