//! Phase-2 directives
//!
//! The injection template is itself a template: the admission webhook renders
//! it once per pod with `[[ ]]` delimiters. Everything inside the delimiters
//! is built here as a typed expression tree and rendered in exactly one place,
//! so quoting and escaping rules cannot drift between fragments.
//!
//! The central type is [`Lookup`]: an annotation key plus a default resolved
//! from the MeshConfig at build time. At admission the pod's annotation wins
//! when present; otherwise the default applies.

use std::fmt;

use thiserror::Error;

/// Opening delimiter of a phase-2 action
pub const OPEN: &str = "[[";
/// Closing delimiter of a phase-2 action
pub const CLOSE: &str = "]]";

/// Status port the proxy listens on unless a pod overrides it
pub const DEFAULT_STATUS_PORT: i64 = 15020;
/// UID and GID the proxy runs as
pub const PROXY_UID: i64 = 1337;

/// Maximum length of the name part of an annotation key
const MAX_KEY_NAME_LEN: usize = 63;
/// Maximum length of the DNS prefix of an annotation key
const MAX_KEY_PREFIX_LEN: usize = 253;

/// Pod annotations consulted at admission time
pub mod annotations {
    /// Traffic interception mode
    pub const INTERCEPTION_MODE: &str = "sidecar.istio.io/interceptionMode";
    /// Proxy image
    pub const PROXY_IMAGE: &str = "sidecar.istio.io/proxyImage";
    /// Discovery server address
    pub const DISCOVERY_ADDRESS: &str = "sidecar.istio.io/discoveryAddress";
    /// Control plane authentication policy
    pub const CONTROL_PLANE_AUTH_POLICY: &str = "sidecar.istio.io/controlPlaneAuthPolicy";
    /// Proxy status port ("0" disables the readiness probe)
    pub const STATUS_PORT: &str = "status.sidecar.istio.io/port";
    /// Application ports probed for readiness
    pub const APPLICATION_PORTS: &str = "readiness.status.sidecar.istio.io/applicationPorts";
    /// Readiness probe initial delay
    pub const READINESS_INITIAL_DELAY: &str =
        "readiness.status.sidecar.istio.io/initialDelaySeconds";
    /// Readiness probe period
    pub const READINESS_PERIOD: &str = "readiness.status.sidecar.istio.io/periodSeconds";
    /// Readiness probe failure threshold
    pub const READINESS_FAILURE_THRESHOLD: &str =
        "readiness.status.sidecar.istio.io/failureThreshold";
    /// Outbound IP ranges to capture
    pub const INCLUDE_OUTBOUND_IP_RANGES: &str = "traffic.sidecar.istio.io/includeOutboundIPRanges";
    /// Outbound IP ranges to bypass
    pub const EXCLUDE_OUTBOUND_IP_RANGES: &str = "traffic.sidecar.istio.io/excludeOutboundIPRanges";
    /// Inbound ports to capture
    pub const INCLUDE_INBOUND_PORTS: &str = "traffic.sidecar.istio.io/includeInboundPorts";
    /// Inbound ports to bypass
    pub const EXCLUDE_INBOUND_PORTS: &str = "traffic.sidecar.istio.io/excludeInboundPorts";
    /// KubeVirt interfaces
    pub const KUBEVIRT_INTERFACES: &str = "traffic.sidecar.istio.io/kubevirtInterfaces";
    /// Custom bootstrap ConfigMap name
    pub const BOOTSTRAP_OVERRIDE: &str = "sidecar.istio.io/bootstrapOverride";
    /// Proxy CPU request
    pub const PROXY_CPU: &str = "sidecar.istio.io/proxyCPU";
    /// Proxy memory request
    pub const PROXY_MEMORY: &str = "sidecar.istio.io/proxyMemory";
    /// Extra volumes, as a JSON object keyed by volume name
    pub const USER_VOLUME: &str = "sidecar.istio.io/userVolume";
    /// Extra volume mounts, as a JSON object keyed by volume name
    pub const USER_VOLUME_MOUNT: &str = "sidecar.istio.io/userVolumeMount";
}

/// Errors raised while building a directive
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DirectiveError {
    /// Annotation key is not a valid Kubernetes annotation key
    #[error("malformed lookup key '{key}': {reason}")]
    MalformedKey {
        /// The offending key
        key: String,
        /// What is wrong with it
        reason: &'static str,
    },

    /// Default value cannot be written as a phase-2 literal
    #[error("default '{value}' cannot be encoded: {reason}")]
    UnencodableDefault {
        /// The offending value
        value: String,
        /// Why it cannot be encoded
        reason: String,
    },

    /// Field reference is not a dotted identifier path
    #[error("invalid field reference '{path}'")]
    InvalidField {
        /// The offending path
        path: String,
    },

    /// Variable is not `$` followed by an identifier
    #[error("invalid variable '{name}'")]
    InvalidVariable {
        /// The offending name
        name: String,
    },

    /// Text spliced into the template contains phase-2 delimiters
    #[error("literal '{value}' contains template delimiters")]
    UnsafeLiteral {
        /// The offending value
        value: String,
    },

    /// A section opens or closes more blocks than it should
    #[error("unbalanced blocks in {section} section")]
    UnbalancedBlocks {
        /// The section being composed
        section: String,
    },
}

/// Reject text that would be re-read as an action at admission time
pub fn ensure_no_delimiters(value: &str) -> Result<(), DirectiveError> {
    if value.contains(OPEN) || value.contains(CLOSE) {
        return Err(DirectiveError::UnsafeLiteral {
            value: value.to_string(),
        });
    }
    Ok(())
}

// =============================================================================
// Atoms
// =============================================================================

/// A validated Kubernetes annotation key, rendered as a raw string
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AnnotationKey(String);

impl AnnotationKey {
    /// Validate `key` as `[prefix/]name`
    pub fn new(key: &str) -> Result<Self, DirectiveError> {
        let malformed = |reason| DirectiveError::MalformedKey {
            key: key.to_string(),
            reason,
        };

        if key.is_empty() {
            return Err(malformed("key is empty"));
        }
        let (prefix, name) = match key.rsplit_once('/') {
            Some((prefix, name)) => (Some(prefix), name),
            None => (None, key),
        };

        if let Some(prefix) = prefix {
            if prefix.is_empty() || prefix.len() > MAX_KEY_PREFIX_LEN {
                return Err(malformed("prefix must be 1-253 characters"));
            }
            let labels_ok = prefix.split('.').all(|label| {
                !label.is_empty()
                    && label
                        .chars()
                        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
                    && !label.starts_with('-')
                    && !label.ends_with('-')
            });
            if !labels_ok {
                return Err(malformed("prefix must be a DNS subdomain"));
            }
        }

        if name.is_empty() || name.len() > MAX_KEY_NAME_LEN {
            return Err(malformed("name must be 1-63 characters"));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(malformed("name may only contain [A-Za-z0-9._-]"));
        }
        let alnum = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric());
        if !alnum(name.chars().next()) || !alnum(name.chars().last()) {
            return Err(malformed("name must start and end with an alphanumeric character"));
        }

        Ok(Self(key.to_string()))
    }

    /// The key as written on pods
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AnnotationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}`", self.0)
    }
}

/// A double-quoted string literal, escaped once at construction
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StrLit {
    encoded: String,
}

impl StrLit {
    /// Encode `value` as a quoted literal
    pub fn new(value: &str) -> Result<Self, DirectiveError> {
        ensure_no_delimiters(value).map_err(|_| DirectiveError::UnencodableDefault {
            value: value.to_string(),
            reason: "contains template delimiters".to_string(),
        })?;
        let encoded =
            serde_json::to_string(value).map_err(|e| DirectiveError::UnencodableDefault {
                value: value.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self { encoded })
    }
}

impl fmt::Display for StrLit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

/// A reference into the admission context, e.g. `.ProxyConfig.BinaryPath`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldPath(String);

impl FieldPath {
    /// Validate a path of one or more `.Ident` segments
    pub fn new(path: &str) -> Result<Self, DirectiveError> {
        let valid = path
            .strip_prefix('.')
            .is_some_and(|rest| rest.split('.').all(is_identifier));
        if !valid {
            return Err(DirectiveError::InvalidField {
                path: path.to_string(),
            });
        }
        Ok(Self(path.to_string()))
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A template variable, e.g. `$index`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Var(String);

impl Var {
    /// Validate `$ident`
    pub fn new(name: &str) -> Result<Self, DirectiveError> {
        if !name.strip_prefix('$').is_some_and(is_identifier) {
            return Err(DirectiveError::InvalidVariable {
                name: name.to_string(),
            });
        }
        Ok(Self(name.to_string()))
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// =============================================================================
// Expressions
// =============================================================================

/// Functions the admission renderer provides
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Func {
    /// JSON-encode a value
    ToJson,
    /// Decode a JSON string
    FromJson,
    /// Render a protobuf duration
    FormatDuration,
    /// Whether a map has a key
    IsSet,
    /// Map lookup
    Index,
    /// First argument unless empty, else the second
    ValueOrDefault,
    /// Equality
    Eq,
    /// Inequality
    Ne,
    /// Greater than
    Gt,
    /// First non-empty argument
    Or,
    /// Format a string
    Printf,
    /// Container ports to capture inbound
    IncludeInboundPorts,
    /// Inbound ports to bypass, always including the status port
    ExcludeInboundPort,
    /// Container ports probed for readiness
    ApplicationPorts,
    /// Encode a value as YAML
    ToYaml,
    /// Indent every line but the first
    Indent,
}

impl Func {
    /// Name of the function in the admission renderer
    pub fn name(&self) -> &'static str {
        match self {
            Self::ToJson => "toJSON",
            Self::FromJson => "fromJSON",
            Self::FormatDuration => "formatDuration",
            Self::IsSet => "isset",
            Self::Index => "index",
            Self::ValueOrDefault => "valueOrDefault",
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Gt => "gt",
            Self::Or => "or",
            Self::Printf => "printf",
            Self::IncludeInboundPorts => "includeInboundPorts",
            Self::ExcludeInboundPort => "excludeInboundPort",
            Self::ApplicationPorts => "applicationPorts",
            Self::ToYaml => "toYaml",
            Self::Indent => "indent",
        }
    }
}

/// A per-pod override with a build-time default
///
/// Renders as `annotation .ObjectMeta `key` default`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lookup {
    key: AnnotationKey,
    default: Box<Expr>,
}

impl Lookup {
    /// Couple `key` with `default`; fails if the key is malformed
    pub fn new(key: &str, default: Expr) -> Result<Self, DirectiveError> {
        Ok(Self {
            key: AnnotationKey::new(key)?,
            default: Box::new(default),
        })
    }

    /// The annotation consulted at admission
    pub fn key(&self) -> &AnnotationKey {
        &self.key
    }

    /// The value used when the pod has no override
    pub fn default_value(&self) -> &Expr {
        &self.default
    }
}

impl fmt::Display for Lookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "annotation .ObjectMeta {} ", self.key)?;
        self.default.fmt_arg(f)
    }
}

/// A phase-2 expression
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Expr {
    /// Field reference
    Field(FieldPath),
    /// Variable reference
    Var(Var),
    /// Quoted string
    Str(StrLit),
    /// Annotation key as a raw string
    Key(AnnotationKey),
    /// Integer
    Int(i64),
    /// Function call
    Call(Func, Vec<Expr>),
    /// `input | func args...`
    Pipe(Box<Expr>, Func, Vec<Expr>),
    /// Per-pod override with default
    Lookup(Lookup),
}

impl Expr {
    /// Field reference
    pub fn field(path: &str) -> Result<Self, DirectiveError> {
        FieldPath::new(path).map(Self::Field)
    }

    /// Variable reference
    pub fn var(name: &str) -> Result<Self, DirectiveError> {
        Var::new(name).map(Self::Var)
    }

    /// Quoted string
    pub fn str(value: &str) -> Result<Self, DirectiveError> {
        StrLit::new(value).map(Self::Str)
    }

    /// Annotation key
    pub fn key(key: &str) -> Result<Self, DirectiveError> {
        AnnotationKey::new(key).map(Self::Key)
    }

    /// Function call
    pub fn call(func: Func, args: Vec<Expr>) -> Self {
        Self::Call(func, args)
    }

    /// Pipe this expression into `func`
    pub fn pipe(self, func: Func, args: Vec<Expr>) -> Self {
        Self::Pipe(Box::new(self), func, args)
    }

    /// Per-pod override of `key` falling back to `default`
    pub fn lookup(key: &str, default: Expr) -> Result<Self, DirectiveError> {
        Lookup::new(key, default).map(Self::Lookup)
    }

    /// `isset .ObjectMeta.Annotations `key``
    pub fn annotation_is_set(key: &str) -> Result<Self, DirectiveError> {
        Ok(Self::call(
            Func::IsSet,
            vec![Self::field(".ObjectMeta.Annotations")?, Self::key(key)?],
        ))
    }

    /// `index .ObjectMeta.Annotations `key``
    pub fn annotation_value(key: &str) -> Result<Self, DirectiveError> {
        Ok(Self::call(
            Func::Index,
            vec![Self::field(".ObjectMeta.Annotations")?, Self::key(key)?],
        ))
    }

    /// Every lookup in this expression, outermost first
    pub fn lookups(&self) -> Vec<&Lookup> {
        let mut out = Vec::new();
        self.collect_lookups(&mut out);
        out
    }

    fn collect_lookups<'a>(&'a self, out: &mut Vec<&'a Lookup>) {
        match self {
            Self::Lookup(lookup) => {
                out.push(lookup);
                lookup.default.collect_lookups(out);
            }
            Self::Call(_, args) => args.iter().for_each(|a| a.collect_lookups(out)),
            Self::Pipe(input, _, args) => {
                input.collect_lookups(out);
                args.iter().for_each(|a| a.collect_lookups(out));
            }
            _ => {}
        }
    }

    fn is_compound(&self) -> bool {
        matches!(self, Self::Call(..) | Self::Pipe(..) | Self::Lookup(_))
    }

    /// Render in argument position, parenthesizing compound expressions
    fn fmt_arg(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_compound() {
            write!(f, "({})", self)
        } else {
            write!(f, "{}", self)
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field(path) => path.fmt(f),
            Self::Var(var) => var.fmt(f),
            Self::Str(lit) => lit.fmt(f),
            Self::Key(key) => key.fmt(f),
            Self::Int(n) => write!(f, "{}", n),
            Self::Call(func, args) => {
                f.write_str(func.name())?;
                for arg in args {
                    f.write_str(" ")?;
                    arg.fmt_arg(f)?;
                }
                Ok(())
            }
            Self::Pipe(input, func, args) => {
                write!(f, "{} | {}", input, func.name())?;
                for arg in args {
                    f.write_str(" ")?;
                    arg.fmt_arg(f)?;
                }
                Ok(())
            }
            Self::Lookup(lookup) => lookup.fmt(f),
        }
    }
}

// =============================================================================
// Actions
// =============================================================================

/// One `[[ ]]` action
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Print the value of an expression
    Emit(Expr),
    /// Open a conditional block
    If(Expr),
    /// Switch to the alternative branch
    Else,
    /// Close the innermost block
    End,
    /// Iterate over a mapping, binding key and value
    Range {
        /// Variable bound to each key
        key: Var,
        /// Variable bound to each value
        value: Var,
        /// The mapping iterated over
        source: Expr,
    },
}

impl Action {
    /// Whether this action opens, switches, or closes a block
    ///
    /// Block actions trim the whitespace before them, so a block action on a
    /// line of its own leaves no blank line behind.
    pub fn is_block(&self) -> bool {
        !matches!(self, Self::Emit(_))
    }

    /// Every lookup this action evaluates
    pub fn lookups(&self) -> Vec<&Lookup> {
        match self {
            Self::Emit(expr) | Self::If(expr) | Self::Range { source: expr, .. } => expr.lookups(),
            Self::Else | Self::End => Vec::new(),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(OPEN)?;
        if self.is_block() {
            f.write_str("-")?;
        }
        match self {
            Self::Emit(expr) => write!(f, " {}", expr)?,
            Self::If(cond) => write!(f, " if {}", cond)?,
            Self::Else => f.write_str(" else")?,
            Self::End => f.write_str(" end")?,
            Self::Range { key, value, source } => {
                write!(f, " range {}, {} := {}", key, value, source)?
            }
        }
        write!(f, " {}", CLOSE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_renders_annotation_call() {
        let lookup = Lookup::new(
            annotations::INTERCEPTION_MODE,
            Expr::field(".ProxyConfig.InterceptionMode").unwrap(),
        )
        .unwrap();
        assert_eq!(
            lookup.to_string(),
            "annotation .ObjectMeta `sidecar.istio.io/interceptionMode` .ProxyConfig.InterceptionMode"
        );
    }

    #[test]
    fn compound_defaults_are_parenthesized() {
        let default = Expr::call(
            Func::IncludeInboundPorts,
            vec![Expr::field(".Spec.Containers").unwrap()],
        );
        let expr = Expr::lookup(annotations::INCLUDE_INBOUND_PORTS, default).unwrap();
        assert_eq!(
            expr.to_string(),
            "annotation .ObjectMeta `traffic.sidecar.istio.io/includeInboundPorts` (includeInboundPorts .Spec.Containers)"
        );
    }

    #[test]
    fn string_defaults_are_json_escaped() {
        let expr = Expr::lookup(annotations::PROXY_IMAGE, Expr::str("a\"b\\c").unwrap()).unwrap();
        assert!(expr.to_string().ends_with(r#""a\"b\\c""#));
    }

    #[test]
    fn defaults_with_delimiters_are_rejected() {
        let err = StrLit::new("x [[ .Evil ]]").unwrap_err();
        assert!(matches!(err, DirectiveError::UnencodableDefault { .. }));
        assert!(Expr::str("trailing ]]").is_err());
    }

    #[test]
    fn annotation_keys_are_validated() {
        for key in [
            annotations::INTERCEPTION_MODE,
            annotations::READINESS_FAILURE_THRESHOLD,
            "plain-key",
            "a.b_c-d",
        ] {
            assert!(AnnotationKey::new(key).is_ok(), "{key}");
        }
        for key in [
            "",
            "sidecar.istio.io/",
            "/name",
            "Sidecar.Istio.io/name",
            "sidecar.istio.io/-leading",
            "sidecar.istio.io/trailing.",
            "has space",
            "back`tick",
            "a..b/name",
        ] {
            assert!(
                matches!(AnnotationKey::new(key), Err(DirectiveError::MalformedKey { .. })),
                "{key}"
            );
        }
        let long = format!("x/{}", "a".repeat(64));
        assert!(AnnotationKey::new(&long).is_err());
    }

    #[test]
    fn field_paths_and_variables_are_validated() {
        assert!(FieldPath::new(".ProxyConfig.GetTracing.GetZipkin.GetAddress").is_ok());
        assert!(FieldPath::new("ProxyConfig").is_err());
        assert!(FieldPath::new(".Proxy..Config").is_err());
        assert!(FieldPath::new(".").is_err());
        assert!(Var::new("$index").is_ok());
        assert!(Var::new("index").is_err());
        assert!(Var::new("$1x").is_err());
    }

    #[test]
    fn pipes_render_left_to_right() {
        let expr = Expr::call(Func::ToYaml, vec![Expr::var("$value").unwrap()])
            .pipe(Func::Indent, vec![Expr::Int(4)]);
        assert_eq!(expr.to_string(), "toYaml $value | indent 4");

        let chained = Expr::var("$value")
            .unwrap()
            .pipe(Func::ToYaml, vec![])
            .pipe(Func::Indent, vec![Expr::Int(2)]);
        assert_eq!(chained.to_string(), "$value | toYaml | indent 2");
    }

    #[test]
    fn block_actions_trim_left() {
        let cond = Expr::annotation_is_set(annotations::BOOTSTRAP_OVERRIDE).unwrap();
        assert_eq!(
            Action::If(cond).to_string(),
            "[[- if isset .ObjectMeta.Annotations `sidecar.istio.io/bootstrapOverride` ]]"
        );
        assert_eq!(Action::End.to_string(), "[[- end ]]");
        assert_eq!(Action::Else.to_string(), "[[- else ]]");
        assert!(!Action::Emit(Expr::Int(1)).is_block());
        assert_eq!(Action::Emit(Expr::Int(1)).to_string(), "[[ 1 ]]");
    }

    #[test]
    fn range_binds_key_and_value() {
        let action = Action::Range {
            key: Var::new("$index").unwrap(),
            value: Var::new("$value").unwrap(),
            source: Expr::call(
                Func::FromJson,
                vec![Expr::annotation_value(annotations::USER_VOLUME).unwrap()],
            ),
        };
        assert_eq!(
            action.to_string(),
            "[[- range $index, $value := fromJSON (index .ObjectMeta.Annotations `sidecar.istio.io/userVolume`) ]]"
        );
    }

    #[test]
    fn lookups_are_found_inside_nested_calls() {
        let status = Expr::lookup(annotations::STATUS_PORT, Expr::Int(DEFAULT_STATUS_PORT)).unwrap();
        let exclude = Expr::lookup(annotations::EXCLUDE_INBOUND_PORTS, Expr::str("").unwrap()).unwrap();
        let expr = Expr::call(Func::ExcludeInboundPort, vec![status, exclude]);
        let keys: Vec<_> = expr.lookups().iter().map(|l| l.key().as_str()).collect();
        assert_eq!(
            keys,
            vec![annotations::STATUS_PORT, annotations::EXCLUDE_INBOUND_PORTS]
        );
        assert_eq!(
            expr.to_string(),
            "excludeInboundPort (annotation .ObjectMeta `status.sidecar.istio.io/port` 15020) (annotation .ObjectMeta `traffic.sidecar.istio.io/excludeInboundPorts` \"\")"
        );
    }
}
