use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(ConversationId, "conv");
branded_id!(ToolCallId, "toolu");
branded_id!(RunId, "run");
branded_id!(ApprovalId, "appr");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes() {
        assert!(ConversationId::new().as_str().starts_with("conv_"));
        assert!(ToolCallId::new().as_str().starts_with("toolu_"));
        assert!(RunId::new().as_str().starts_with("run_"));
        assert!(ApprovalId::new().as_str().starts_with("appr_"));
    }

    #[test]
    fn ids_are_unique() {
        let ids: std::collections::HashSet<RunId> = (0..50).map(|_| RunId::new()).collect();
        assert_eq!(ids.len(), 50);
    }

    #[test]
    fn parse_keeps_raw_value() {
        let id: ApprovalId = "appr_custom".parse().unwrap();
        assert_eq!(id, ApprovalId::from_raw("appr_custom"));
        assert_eq!(id.to_string(), "appr_custom");
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = ConversationId::from_raw("conv_1");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""conv_1""#);
    }
}
