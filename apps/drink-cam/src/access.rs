use crate::error::SessionError;

/// Optional shared-key gate in front of start and stop.
#[derive(Debug, Clone)]
pub struct AccessGate {
    required: Option<String>,
    granted: bool,
}

impl AccessGate {
    pub fn new(required: Option<String>) -> Self {
        let required = required
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty());
        let granted = required.is_none();
        Self { required, granted }
    }

    pub fn open() -> Self {
        Self::new(None)
    }

    pub fn is_required(&self) -> bool {
        self.required.is_some()
    }

    pub fn is_granted(&self) -> bool {
        self.granted
    }

    pub fn grant(&mut self, candidate: &str) -> Result<(), SessionError> {
        let Some(required) = &self.required else {
            self.granted = true;
            return Ok(());
        };
        let candidate = candidate.trim();
        if candidate.is_empty() {
            return Err(SessionError::AccessRequired);
        }
        if candidate != required {
            return Err(SessionError::AccessDenied);
        }
        self.granted = true;
        Ok(())
    }

    pub fn check(&self) -> Result<(), SessionError> {
        if self.granted {
            Ok(())
        } else {
            Err(SessionError::AccessRequired)
        }
    }
}
