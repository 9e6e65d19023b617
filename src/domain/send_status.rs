/// Lifecycle of a newsletter release. Statuses only ever move forward:
/// `draft -> ready_to_send -> sending -> {sent, failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
    Draft,
    ReadyToSend,
    Sending,
    Sent,
    Failed,
}

impl SendStatus {
    pub fn is_draft(&self) -> bool {
        matches!(self, SendStatus::Draft)
    }

    pub fn is_ready_to_send(&self) -> bool {
        matches!(self, SendStatus::ReadyToSend)
    }

    pub fn is_sending(&self) -> bool {
        matches!(self, SendStatus::Sending)
    }

    /// `sent` and `failed` are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SendStatus::Sent | SendStatus::Failed)
    }

    /// `sending -> sending` is allowed: a newsletter larger than one day's quota keeps
    /// being dispatched across several passes.
    pub fn can_transition_to(&self, next: SendStatus) -> bool {
        matches!(
            (self, next),
            (SendStatus::Draft, SendStatus::ReadyToSend)
                | (SendStatus::ReadyToSend, SendStatus::Sending)
                | (SendStatus::Sending, SendStatus::Sending)
                | (SendStatus::Sending, SendStatus::Sent)
                | (SendStatus::Sending, SendStatus::Failed)
        )
    }

    pub fn transition(self, next: SendStatus) -> Result<SendStatus, String> {
        if !self.can_transition_to(next) {
            return Err(format!(
                "newsletter cannot move from {} to {}",
                self.as_ref(),
                next.as_ref()
            ));
        }

        Ok(next)
    }

    pub fn parse(status: String) -> Result<SendStatus, String> {
        match status.as_str() {
            "draft" => Ok(SendStatus::Draft),
            "ready_to_send" => Ok(SendStatus::ReadyToSend),
            "sending" => Ok(SendStatus::Sending),
            "sent" => Ok(SendStatus::Sent),
            "failed" => Ok(SendStatus::Failed),
            _ => Err(format!("{} is not a valid newsletter send status", status)),
        }
    }
}

impl AsRef<str> for SendStatus {
    fn as_ref(&self) -> &str {
        match self {
            SendStatus::Draft => "draft",
            SendStatus::ReadyToSend => "ready_to_send",
            SendStatus::Sending => "sending",
            SendStatus::Sent => "sent",
            SendStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}
