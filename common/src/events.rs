use serde::{Deserialize, Serialize};

/// OctoPrint print lifecycle events the controller reacts to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PrintEvent {
    Connected,
    Disconnected,
    PrintStarted,
    PrintPaused,
    PrintResumed,
    PrintCancelling,
    PrintCancelled,
    PrintDone,
    PrintFailed,
    Other(String),
}

impl PrintEvent {
    pub fn parse(name: &str) -> Self {
        match name {
            "Connected" => Self::Connected,
            "Disconnected" => Self::Disconnected,
            "PrintStarted" => Self::PrintStarted,
            "PrintPaused" => Self::PrintPaused,
            "PrintResumed" => Self::PrintResumed,
            "PrintCancelling" => Self::PrintCancelling,
            "PrintCancelled" => Self::PrintCancelled,
            "PrintDone" => Self::PrintDone,
            "PrintFailed" => Self::PrintFailed,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Connected => "Connected",
            Self::Disconnected => "Disconnected",
            Self::PrintStarted => "PrintStarted",
            Self::PrintPaused => "PrintPaused",
            Self::PrintResumed => "PrintResumed",
            Self::PrintCancelling => "PrintCancelling",
            Self::PrintCancelled => "PrintCancelled",
            Self::PrintDone => "PrintDone",
            Self::PrintFailed => "PrintFailed",
            Self::Other(name) => name,
        }
    }
}

impl From<String> for PrintEvent {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<PrintEvent> for String {
    fn from(value: PrintEvent) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for PrintEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
