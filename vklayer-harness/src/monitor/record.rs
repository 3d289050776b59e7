use ash::vk;
use std::fmt;

/// Severity of a single diagnostic record.
///
/// Both debug extensions are folded into the debug-report vocabulary, which
/// is also the vocabulary of expectation masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Info,
    Warning,
    PerformanceWarning,
    Error,
    Debug,
}

impl Severity {
    /// The debug-report flag bit for this severity.
    pub fn flag(self) -> vk::DebugReportFlagsEXT {
        match self {
            Severity::Info => vk::DebugReportFlagsEXT::INFORMATION,
            Severity::Warning => vk::DebugReportFlagsEXT::WARNING,
            Severity::PerformanceWarning => vk::DebugReportFlagsEXT::PERFORMANCE_WARNING,
            Severity::Error => vk::DebugReportFlagsEXT::ERROR,
            Severity::Debug => vk::DebugReportFlagsEXT::DEBUG,
        }
    }

    /// Picks the most severe bit present in a debug-report flag set.
    pub fn from_report_flags(flags: vk::DebugReportFlagsEXT) -> Self {
        if flags.contains(vk::DebugReportFlagsEXT::ERROR) {
            Severity::Error
        } else if flags.contains(vk::DebugReportFlagsEXT::WARNING) {
            Severity::Warning
        } else if flags.contains(vk::DebugReportFlagsEXT::PERFORMANCE_WARNING) {
            Severity::PerformanceWarning
        } else if flags.contains(vk::DebugReportFlagsEXT::INFORMATION) {
            Severity::Info
        } else {
            Severity::Debug
        }
    }

    /// Maps a debug-utils severity/type pair.
    pub fn from_utils(
        severity: vk::DebugUtilsMessageSeverityFlagsEXT,
        types: vk::DebugUtilsMessageTypeFlagsEXT,
    ) -> Self {
        if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
            Severity::Error
        } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
            if types.contains(vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE) {
                Severity::PerformanceWarning
            } else {
                Severity::Warning
            }
        } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
            Severity::Info
        } else {
            Severity::Debug
        }
    }

    pub fn is_error(self) -> bool {
        self == Severity::Error
    }

    pub fn label(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::PerformanceWarning => "perf-warning",
            Severity::Error => "error",
            Severity::Debug => "debug",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One message received from the validation sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticRecord {
    pub severity: Severity,
    pub message_types: vk::DebugUtilsMessageTypeFlagsEXT,
    /// Structured id when the sink provides one, otherwise the first
    /// `VUID-` (or `UNASSIGNED-`) token found in the body. May be empty.
    pub message_id: String,
    pub message: String,
    pub layer_prefix: String,
    pub object_type: vk::DebugReportObjectTypeEXT,
    pub object_handle: u64,
    pub message_code: i32,
}

impl DiagnosticRecord {
    /// A validation record with the id extracted from the body.
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        let message = message.into();
        let message_id = extract_message_id(&message).unwrap_or_default().to_string();
        Self {
            severity,
            message_types: vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
            message_id,
            message,
            layer_prefix: String::new(),
            object_type: vk::DebugReportObjectTypeEXT::UNKNOWN,
            object_handle: 0,
            message_code: 0,
        }
    }

    /// Overrides the extracted id with a structured one. Empty ids are ignored.
    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        if !id.is_empty() {
            self.message_id = id;
        }
        self
    }

    pub fn with_layer_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.layer_prefix = prefix.into();
        self
    }

    pub fn with_object(mut self, object_type: vk::DebugReportObjectTypeEXT, handle: u64) -> Self {
        self.object_type = object_type;
        self.object_handle = handle;
        self
    }

    pub fn with_message_code(mut self, code: i32) -> Self {
        self.message_code = code;
        self
    }

    /// Exact substring match against the id and the body.
    pub fn contains(&self, needle: &str) -> bool {
        self.message_id.contains(needle) || self.message.contains(needle)
    }
}

fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

/// Finds the first message-id token in a message body.
///
/// `VUID-` tokens win over `UNASSIGNED-` tokens. The token runs until the
/// first character outside `[A-Za-z0-9_-]`.
pub fn extract_message_id(message: &str) -> Option<&str> {
    ["VUID-", "UNASSIGNED-"].iter().find_map(|prefix| {
        message.match_indices(prefix).find_map(|(start, _)| {
            let boundary_ok = message[..start]
                .chars()
                .next_back()
                .map_or(true, |c| !is_id_char(c));
            if !boundary_ok {
                return None;
            }
            let rest = &message[start..];
            let end = rest.find(|c: char| !is_id_char(c)).unwrap_or(rest.len());
            let token = rest[..end].trim_end_matches('-');
            (token.len() > prefix.len()).then_some(token)
        })
    })
}
