use thiserror::Error;

/// Structured failure crossing a component edge: handler errors, executor errors and
/// collaborator errors all surface as a `Fault`. The `Kind:message` display form is what
/// lands in result reasons and job errors.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{kind}:{message}")]
pub struct Fault {
    pub kind: String,
    pub message: String,
}

impl Fault {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self { kind: kind.into(), message: message.into() }
    }

    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::new("InvalidPayload", message)
    }

    pub fn invalid_job(message: impl Into<String>) -> Self {
        Self::new("InvalidJob", message)
    }

    pub fn integration(message: impl Into<String>) -> Self {
        Self::new("IntegrationError", message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new("Timeout", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("InternalError", message)
    }
}

impl From<serde_json::Error> for Fault {
    fn from(error: serde_json::Error) -> Self {
        Self::invalid_payload(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use crate::errors::Fault;

    #[test]
    fn fault_displays_kind_and_message() {
        let fault = Fault::integration("upstream returned 502");
        assert_eq!(fault.to_string(), "IntegrationError:upstream returned 502");
    }

    #[test]
    fn message_may_itself_contain_separators() {
        let fault = Fault::invalid_job("unknown_job_type:reindex");
        assert_eq!(fault.to_string(), "InvalidJob:unknown_job_type:reindex");
    }

    #[test]
    fn json_errors_map_to_invalid_payload() {
        let error = match serde_json::from_str::<serde_json::Value>("{not json") {
            Ok(_) => panic!("expected a decode error"),
            Err(error) => error,
        };

        let fault = Fault::from(error);
        assert_eq!(fault.kind, "InvalidPayload");
    }
}
