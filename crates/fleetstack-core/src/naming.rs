//! Deterministic resource naming
//!
//! Every resource gets one derived name, computed from the owning stack, the
//! environment and the resource name. Export keys are derived from that name,
//! so the Create and Adopt paths of a resource always publish the same keys.
//!
//! Platform restrictions (length, case, allowed characters) are applied with
//! [`NameRules`] only when a request is handed to the provisioning engine,
//! never before an export key is computed.

use crate::error::{Result, StackError};
use crate::model::ConsumerRelation;

/// Joins the parts of derived names and consumer identities
pub const NAME_SEPARATOR: &str = "--";

/// Check one user-supplied name part (stack, resource or relation name).
///
/// Parts are joined with [`NAME_SEPARATOR`], so a part containing it could
/// reproduce the joined name of a different stack or consumer.
pub fn validate_name_part(part: &str) -> Result<()> {
    if part.is_empty() {
        return Err(StackError::config(part, "name must not be empty"));
    }
    if part.contains(NAME_SEPARATOR) {
        return Err(StackError::config(
            part,
            format!("name must not contain '{}'", NAME_SEPARATOR),
        ));
    }
    Ok(())
}

/// Environment used as the naming suffix.
///
/// A stack deployed into a custom environment (a preview, a per-branch stack)
/// that declares a different parent environment names its resources after the
/// parent environment, so both share one underlying resource.
pub fn naming_env<'a>(env: &'a str, parent_env: Option<&'a str>) -> &'a str {
    match parent_env {
        Some(parent) if !parent.is_empty() && parent != env => parent,
        _ => env,
    }
}

/// Derive the canonical name of a resource.
///
/// ```
/// use fleetstack_core::naming::derive_name;
///
/// assert_eq!(derive_name("base", "prod", None, "cache"), "base--cache--prod");
/// assert_eq!(
///     derive_name("base", "pr-42", Some("prod"), "cache"),
///     derive_name("base", "prod", None, "cache"),
/// );
/// ```
pub fn derive_name(stack: &str, env: &str, parent_env: Option<&str>, resource: &str) -> String {
    let suffix = naming_env(env, parent_env);
    [stack, resource, suffix].join(NAME_SEPARATOR)
}

/// Export key for one output of a resource (`<derived-name>-<suffix>`)
pub fn export_key(derived_name: &str, suffix: &str) -> String {
    format!("{}-{}", derived_name, suffix)
}

/// Identity a consumer authenticates with against a shared resource.
///
/// `uses` consumers are identified by their stack alone. `dependsOn`
/// consumers always embed the relation name, so several dependents of one
/// owner resource never collide with each other or with a `uses` consumer.
pub fn consumer_identity(consumer_stack: &str, relation: &ConsumerRelation) -> String {
    match relation {
        ConsumerRelation::Uses => consumer_stack.to_string(),
        ConsumerRelation::DependsOn { name, .. } => {
            format!("{}{}dep{}{}", consumer_stack, NAME_SEPARATOR, NAME_SEPARATOR, name)
        }
    }
}

/// Character and length rules of an external platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameRules {
    /// Maximum length accepted by the platform
    pub max_len: usize,
    /// Whether the platform rejects upper case letters
    pub lowercase: bool,
    /// Character substituted for anything outside `[a-z0-9]`
    pub separator: char,
    /// Whether the name must start with a letter
    pub leading_letter: bool,
}

impl NameRules {
    /// Cloud SQL instance ids
    pub const CLOUDSQL_INSTANCE: NameRules = NameRules {
        max_len: 84,
        lowercase: true,
        separator: '-',
        leading_letter: true,
    };

    /// Memorystore instance ids
    pub const MEMORYSTORE_INSTANCE: NameRules = NameRules {
        max_len: 40,
        lowercase: true,
        separator: '-',
        leading_letter: true,
    };

    /// Cloud Storage bucket names
    pub const GCS_BUCKET: NameRules = NameRules {
        max_len: 63,
        lowercase: true,
        separator: '-',
        leading_letter: false,
    };

    /// Pub/Sub topic ids
    pub const PUBSUB_TOPIC: NameRules = NameRules {
        max_len: 255,
        lowercase: false,
        separator: '-',
        leading_letter: true,
    };

    /// GKE cluster names
    pub const GKE_CLUSTER: NameRules = NameRules {
        max_len: 40,
        lowercase: true,
        separator: '-',
        leading_letter: true,
    };

    /// Service account ids
    pub const SERVICE_ACCOUNT: NameRules = NameRules {
        max_len: 30,
        lowercase: true,
        separator: '-',
        leading_letter: true,
    };

    /// Kubernetes object names (jobs, pods)
    pub const KUBERNETES_NAME: NameRules = NameRules {
        max_len: 63,
        lowercase: true,
        separator: '-',
        leading_letter: true,
    };

    /// PostgreSQL role and database names
    pub const POSTGRES_IDENTIFIER: NameRules = NameRules {
        max_len: 63,
        lowercase: true,
        separator: '_',
        leading_letter: true,
    };

    /// Apply the rules to a derived name.
    ///
    /// Truncated names keep a short hash of the full name so two long names
    /// sharing a prefix stay distinct.
    pub fn apply(&self, name: &str) -> String {
        let mut out: String = name
            .chars()
            .map(|c| {
                let c = if self.lowercase {
                    c.to_ascii_lowercase()
                } else {
                    c
                };
                if c.is_ascii_alphanumeric() {
                    c
                } else {
                    self.separator
                }
            })
            .collect();

        if self.leading_letter && !out.starts_with(|c: char| c.is_ascii_alphabetic()) {
            out.insert(0, 'r');
        }

        if out.len() > self.max_len {
            let hash = format!("{:08x}", fnv1a(name.as_bytes()));
            let keep = self.max_len.saturating_sub(hash.len() + 1);
            out.truncate(keep);
            let trimmed = out.trim_end_matches(self.separator).to_string();
            out = format!("{}{}{}", trimmed, self.separator, hash);
        }

        out.trim_end_matches(self.separator).to_string()
    }

    /// Apply the rules, keeping distinct inputs distinct.
    ///
    /// A name the rules had to rewrite carries a hash of the original, so
    /// `api-v2` and `api_v2` do not map onto the same identifier.
    pub fn apply_distinct(&self, name: &str) -> String {
        let out = self.apply(name);
        let hash = format!("{:08x}", fnv1a(name.as_bytes()));
        if out == name || out.ends_with(&hash) {
            return out;
        }
        let mut head = out;
        head.truncate(self.max_len.saturating_sub(hash.len() + 1));
        format!("{}{}{}", head.trim_end_matches(self.separator), self.separator, hash)
    }
}

fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in bytes {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_env_equal_to_env_is_noop() {
        assert_eq!(
            derive_name("base", "prod", Some("prod"), "db"),
            derive_name("base", "prod", None, "db")
        );
        assert_eq!(
            derive_name("base", "prod", Some(""), "db"),
            derive_name("base", "prod", None, "db")
        );
    }

    #[test]
    fn test_parent_env_collapses_preview_onto_parent() {
        assert_eq!(
            derive_name("base", "preview", Some("prod"), "db"),
            derive_name("base", "prod", None, "db")
        );
        assert_ne!(
            derive_name("base", "preview", None, "db"),
            derive_name("base", "prod", None, "db")
        );
    }

    #[test]
    fn test_export_key() {
        let name = derive_name("base", "prod", None, "cache");
        assert_eq!(export_key(&name, "host"), "base--cache--prod-host");
    }

    #[test]
    fn test_consumer_identity_does_not_collide() {
        let uses = consumer_identity("api", &ConsumerRelation::Uses);
        let dep_a = consumer_identity(
            "api",
            &ConsumerRelation::DependsOn {
                name: "db".to_string(),
                owner: "base".to_string(),
            },
        );
        let dep_b = consumer_identity(
            "worker",
            &ConsumerRelation::DependsOn {
                name: "db".to_string(),
                owner: "base".to_string(),
            },
        );

        assert_eq!(uses, "api");
        assert_ne!(dep_a, dep_b);
        assert_ne!(dep_a, uses);
        assert!(dep_a.contains("api") && dep_a.contains("db"));
    }

    #[test]
    fn test_name_rules_lowercase_and_separator() {
        assert_eq!(
            NameRules::POSTGRES_IDENTIFIER.apply("Api--dep--orders"),
            "api__dep__orders"
        );
        assert_eq!(NameRules::GCS_BUCKET.apply("Base--Assets--prod"), "base--assets--prod");
    }

    #[test]
    fn test_apply_distinct_tags_rewritten_names() {
        let rules = NameRules::POSTGRES_IDENTIFIER;
        assert_eq!(rules.apply_distinct("reports"), "reports");

        let dashed = rules.apply_distinct("api-v2");
        let underscored = rules.apply_distinct("api_v2");
        assert_eq!(underscored, "api_v2");
        assert!(dashed.starts_with("api_v2_"));
        assert_ne!(dashed, underscored);

        let upper = rules.apply_distinct("Api");
        assert_ne!(upper, rules.apply_distinct("api"));

        let long = "a".repeat(80);
        let tagged = rules.apply_distinct(&long);
        assert!(tagged.len() <= rules.max_len);
        assert_eq!(tagged, rules.apply(&long));
    }

    #[test]
    fn test_name_parts_reject_separator() {
        assert!(validate_name_part("api").is_ok());
        assert!(validate_name_part("api-v2").is_ok());
        assert!(validate_name_part("api--dep--orders").is_err());
        assert!(validate_name_part("").is_err());
    }

    #[test]
    fn test_name_rules_leading_letter() {
        assert_eq!(NameRules::MEMORYSTORE_INSTANCE.apply("1cache"), "r1cache");
    }

    #[test]
    fn test_name_rules_truncation_keeps_names_distinct() {
        let rules = NameRules::MEMORYSTORE_INSTANCE;
        let a = rules.apply("very-long-stack-name--session-cache--staging-a");
        let b = rules.apply("very-long-stack-name--session-cache--staging-b");

        assert!(a.len() <= rules.max_len);
        assert!(b.len() <= rules.max_len);
        assert_ne!(a, b);
        assert_eq!(a, rules.apply("very-long-stack-name--session-cache--staging-a"));
    }
}
