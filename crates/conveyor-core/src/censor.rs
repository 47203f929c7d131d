//! Dynamic secret redaction.
//!
//! Every artifact and log line the orchestrator writes passes through a
//! process-wide [`DynamicCensor`] before it leaves the process. The censor is
//! append-only: secrets are registered as they are minted or loaded and are
//! never removed. Readers take a shared lock, so concurrent censoring never
//! blocks on other readers.
//!
//! The censor is constructed once at program entry and passed explicitly to
//! the components that need it; tests inject a fresh instance.

use std::sync::RwLock;

/// Replacement text for every censored secret.
pub const CENSORED: &str = "CENSORED";

/// An append-only set of secrets to scrub from output.
#[derive(Debug, Default)]
pub struct DynamicCensor {
    secrets: RwLock<Vec<Vec<u8>>>,
}

impl DynamicCensor {
    /// Creates an empty censor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers secrets to be scrubbed from all future output.
    ///
    /// Empty values are ignored so that an unset credential cannot turn the
    /// censor into an infinite replacer.
    pub fn add_secrets<I, S>(&self, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<Vec<u8>>,
    {
        let mut guard = self.secrets.write().unwrap_or_else(|e| e.into_inner());
        for value in values {
            let value = value.into();
            if !value.is_empty() && !guard.contains(&value) {
                guard.push(value);
            }
        }
    }

    /// Replaces every registered secret in `data` with [`CENSORED`].
    pub fn censor(&self, data: &mut Vec<u8>) {
        let guard = self.secrets.read().unwrap_or_else(|e| e.into_inner());
        for secret in guard.iter() {
            replace_all(data, secret, CENSORED.as_bytes());
        }
    }

    /// Censors a string, returning the scrubbed copy.
    #[must_use]
    pub fn censor_str(&self, value: &str) -> String {
        let mut data = value.as_bytes().to_vec();
        self.censor(&mut data);
        String::from_utf8_lossy(&data).into_owned()
    }
}

fn replace_all(data: &mut Vec<u8>, needle: &[u8], replacement: &[u8]) {
    if needle.is_empty() {
        return;
    }
    let mut start = 0;
    while start + needle.len() <= data.len() {
        if &data[start..start + needle.len()] == needle {
            data.splice(start..start + needle.len(), replacement.iter().copied());
            start += replacement.len();
        } else {
            start += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn censors_registered_secrets() {
        let censor = DynamicCensor::new();
        censor.add_secrets(["hunter2"]);
        let mut data = b"password is hunter2, repeat hunter2".to_vec();
        censor.censor(&mut data);
        assert_eq!(data, b"password is CENSORED, repeat CENSORED".to_vec());
    }

    #[test]
    fn ignores_empty_secrets() {
        let censor = DynamicCensor::new();
        censor.add_secrets([""]);
        let mut data = b"nothing to hide".to_vec();
        censor.censor(&mut data);
        assert_eq!(data, b"nothing to hide".to_vec());
    }

    #[test]
    fn censoring_is_append_only_across_threads() {
        use std::sync::Arc;

        let censor = Arc::new(DynamicCensor::new());
        let writer = Arc::clone(&censor);
        let handle = std::thread::spawn(move || {
            writer.add_secrets(["token-abc"]);
        });
        handle.join().unwrap();
        assert_eq!(censor.censor_str("token-abc"), CENSORED);
    }

    #[test]
    fn replacement_shorter_than_secret() {
        let censor = DynamicCensor::new();
        censor.add_secrets(["a-very-long-secret-value"]);
        assert_eq!(censor.censor_str("xa-very-long-secret-valuey"), "xCENSOREDy");
    }
}
