use crate::{FunctionDefinition, Scope};
use sha2::{Digest, Sha256};
use std::fmt::Write;

/// The derived cluster identity of a function definition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceIdentity {
    /// Cluster object name, already label-sanitized.
    pub name: String,
    pub scope: Scope,
    /// Short content hash of the definition; empty for namespace scope.
    pub revision_hash: String,
}

// === impl ServiceIdentity ===

impl ServiceIdentity {
    /// Derives the stable cluster identity for a definition.
    ///
    /// Workflow-scoped functions hash the namespace id, the workflow id, and
    /// the canonical definition tuple; namespace-scoped functions hash only
    /// the namespace name and the logical name, so that redefinitions of the
    /// same logical function resolve to the same service.
    pub fn new(fd: &FunctionDefinition) -> Self {
        if !fd.workflow.is_empty() {
            let tuple = canonical_tuple(fd);
            let h = fingerprint(&format!("{}:{}:{}", fd.namespace, fd.workflow, tuple));
            Self {
                name: sanitize_label(&format!("w-{}", h)),
                scope: Scope::Workflow,
                revision_hash: format!("{:x}", fingerprint(&tuple)),
            }
        } else {
            let h = fingerprint(&format!("{}:{}", fd.namespace_name, fd.name));
            Self {
                name: sanitize_label(&format!("ns-{}", h)),
                scope: Scope::Namespace,
                revision_hash: String::new(),
            }
        }
    }
}

/// Canonicalizes the definition fields that participate in workflow-scoped
/// identity. Key order is fixed; envs keep their declared order.
fn canonical_tuple(fd: &FunctionDefinition) -> String {
    let mut s = String::new();
    write!(
        s,
        "cmd={};name={};image={};size={};envs=",
        fd.cmd, fd.name, fd.image, fd.size
    )
    .expect("writing to a string is infallible");
    for (i, (k, v)) in fd.envs.iter().enumerate() {
        if i > 0 {
            s.push(',');
        }
        write!(s, "{}={}", k, v).expect("writing to a string is infallible");
    }
    s
}

/// A collision-resistant 64-bit fingerprint, rendered from the leading bytes
/// of a SHA-256 digest.
pub fn fingerprint(s: &str) -> u64 {
    let digest = Sha256::digest(s.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Normalizes a string into a valid label/object name: lowercase, leading and
/// trailing slashes stripped, `_` and `/` mapped to `-`, truncated to 63
/// characters.
pub fn sanitize_label(s: &str) -> String {
    let mut out: String = s
        .trim_matches('/')
        .chars()
        .map(|c| match c {
            '_' | '/' => '-',
            c => c.to_ascii_lowercase(),
        })
        .collect();
    if out.len() > 63 {
        let mut end = 63;
        while !out.is_char_boundary(end) {
            end -= 1;
        }
        out.truncate(end);
    }
    out
}

/// Obfuscates a registry user, leaving at most the first and last characters
/// visible.
pub fn obfuscate_user(user: &str) -> String {
    match user.len() {
        0 => String::new(),
        1..=3 => format!("{}***", &user[..1]),
        4 | 5 => format!("{}***{}", &user[..1], &user[user.len() - 1..]),
        _ => format!("{}***{}", &user[..2], &user[user.len() - 2..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Size;

    fn mk_definition(workflow: &str) -> FunctionDefinition {
        FunctionDefinition {
            namespace: "ns-uid-1".into(),
            namespace_name: "n1".into(),
            workflow: workflow.into(),
            path: "/wf.yaml".into(),
            name: "echo".into(),
            image: "alpine".into(),
            cmd: "sh -c 'echo hi'".into(),
            size: Size::Small,
            min_scale: 1,
            envs: vec![("A".into(), "1".into()), ("B".into(), "2".into())],
        }
    }

    #[test]
    fn names_are_deterministic() {
        let a = ServiceIdentity::new(&mk_definition("wf-uid-1"));
        let b = ServiceIdentity::new(&mk_definition("wf-uid-1"));
        assert_eq!(a, b);
        assert_eq!(a.scope, Scope::Workflow);
        assert!(a.name.starts_with("w-"));
        assert!(!a.revision_hash.is_empty());
    }

    #[test]
    fn names_are_label_safe() {
        for fd in &[mk_definition(""), mk_definition("wf-uid-1")] {
            let id = ServiceIdentity::new(fd);
            assert!(id.name.len() <= 63);
            assert!(id
                .name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
        }
    }

    #[test]
    fn namespace_scope_ignores_definition_content() {
        let a = ServiceIdentity::new(&mk_definition(""));
        let mut fd = mk_definition("");
        fd.image = "alpine:3.14".into();
        let b = ServiceIdentity::new(&fd);
        // Same namespace + name resolve to the same service.
        assert_eq!(a.name, b.name);
        assert_eq!(a.scope, Scope::Namespace);
        assert!(a.name.starts_with("ns-"));
        assert!(a.revision_hash.is_empty());
    }

    #[test]
    fn workflow_scope_tracks_definition_content() {
        let a = ServiceIdentity::new(&mk_definition("wf-uid-1"));
        let mut fd = mk_definition("wf-uid-1");
        fd.image = "alpine:3.14".into();
        let b = ServiceIdentity::new(&fd);
        assert_ne!(a.name, b.name);
        assert_ne!(a.revision_hash, b.revision_hash);
    }

    #[test]
    fn env_order_is_significant() {
        let a = ServiceIdentity::new(&mk_definition("wf-uid-1"));
        let mut fd = mk_definition("wf-uid-1");
        fd.envs.reverse();
        let b = ServiceIdentity::new(&fd);
        assert_ne!(a.name, b.name);
    }

    #[test]
    fn sanitize() {
        assert_eq!(sanitize_label("/Foo/Bar_baz/"), "foo-bar-baz");
        let long = "a".repeat(100);
        assert_eq!(sanitize_label(&long).len(), 63);
    }

    #[test]
    fn obfuscation() {
        assert_eq!(obfuscate_user(""), "");
        assert_eq!(obfuscate_user("al"), "a***");
        assert_eq!(obfuscate_user("bob"), "b***");
        assert_eq!(obfuscate_user("finn"), "f***n");
        assert_eq!(obfuscate_user("alice"), "a***e");
        assert_eq!(obfuscate_user("aliceb"), "al***eb");
        assert_eq!(obfuscate_user("alexander"), "al***er");
        // Deterministic.
        assert_eq!(obfuscate_user("alice"), obfuscate_user("alice"));
    }
}
