//! The synthesized artifact and the fragment builder it is made of
//!
//! A [`Fragment`] is an ordered list of segments: literal text resolved at
//! build time, and phase-2 [`Action`]s left for the admission webhook.
//! Keeping the two apart until the final render is what lets tests ask
//! "which lookups does this template perform" without parsing text.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::directive::{ensure_no_delimiters, Action, DirectiveError, Expr, Lookup, StrLit, Var};
use crate::error::SynthesisError;

/// One piece of a fragment
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Segment {
    /// Text resolved at build time
    Text(String),
    /// Text deferred to admission time
    Action(Action),
}

/// An ordered run of literal text and phase-2 actions
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Fragment {
    segments: Vec<Segment>,
}

impl Fragment {
    /// An empty fragment
    pub fn new() -> Self {
        Self::default()
    }

    /// Append template text written in this crate
    pub fn text(&mut self, text: &'static str) -> &mut Self {
        self.push_text(text);
        self
    }

    /// Append text derived from configuration
    ///
    /// Fails if the text contains phase-2 delimiters.
    pub fn literal(&mut self, text: &str) -> Result<&mut Self, DirectiveError> {
        ensure_no_delimiters(text)?;
        self.push_text(text);
        Ok(self)
    }

    /// Append a configuration value as a double-quoted YAML scalar
    pub fn quoted(&mut self, value: &str) -> Result<&mut Self, DirectiveError> {
        let lit = StrLit::new(value)?;
        self.push_text(&lit.to_string());
        Ok(self)
    }

    /// Append an inline action printing `expr`
    pub fn emit(&mut self, expr: Expr) -> &mut Self {
        self.segments.push(Segment::Action(Action::Emit(expr)));
        self
    }

    /// Append a block action on a line of its own at `indent`
    fn block(&mut self, indent: usize, action: Action) -> &mut Self {
        self.push_text(&" ".repeat(indent));
        self.segments.push(Segment::Action(action));
        self.push_text("\n");
        self
    }

    /// Open a conditional block
    pub fn open_if(&mut self, indent: usize, cond: Expr) -> &mut Self {
        self.block(indent, Action::If(cond))
    }

    /// Switch to the alternative branch of the innermost conditional
    pub fn open_else(&mut self, indent: usize) -> &mut Self {
        self.block(indent, Action::Else)
    }

    /// Close the innermost block
    pub fn close(&mut self, indent: usize) -> &mut Self {
        self.block(indent, Action::End)
    }

    /// Open a range over a mapping
    pub fn open_range(&mut self, indent: usize, key: Var, value: Var, source: Expr) -> &mut Self {
        self.block(indent, Action::Range { key, value, source })
    }

    /// Append all of `other`
    pub fn append(&mut self, other: Fragment) -> &mut Self {
        for segment in other.segments {
            match segment {
                Segment::Text(text) => self.push_text(&text),
                action => self.segments.push(action),
            }
        }
        self
    }

    /// Append serialized YAML produced from configuration
    pub fn yaml_block(&mut self, block: &str, yaml: &str) -> Result<&mut Self, SynthesisError> {
        ensure_no_delimiters(yaml).map_err(|_| {
            SynthesisError::serialization(block, "rendered YAML contains template delimiters")
        })?;
        self.push_text(yaml);
        Ok(self)
    }

    fn push_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(Segment::Text(last)) = self.segments.last_mut() {
            last.push_str(text);
        } else {
            self.segments.push(Segment::Text(text.to_string()));
        }
    }

    /// The segments in order
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Every lookup performed by this fragment, in template order
    pub fn lookups(&self) -> Vec<&Lookup> {
        self.segments
            .iter()
            .flat_map(|segment| match segment {
                Segment::Action(action) => action.lookups(),
                Segment::Text(_) => Vec::new(),
            })
            .collect()
    }

    /// Check that every block opened is closed, and nothing closes twice
    pub fn is_balanced(&self) -> bool {
        let mut depth: usize = 0;
        for segment in &self.segments {
            match segment {
                Segment::Action(Action::If(_) | Action::Range { .. }) => depth += 1,
                Segment::Action(Action::Else) if depth == 0 => return false,
                Segment::Action(Action::End) => match depth.checked_sub(1) {
                    Some(d) => depth = d,
                    None => return false,
                },
                _ => {}
            }
        }
        depth == 0
    }
}

impl fmt::Display for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => f.write_str(text)?,
                Segment::Action(action) => action.fmt(f)?,
            }
        }
        Ok(())
    }
}

// =============================================================================
// Artifact
// =============================================================================

/// The four blocks of the template, in output order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SectionKind {
    /// Pod-level settings (probe rewriting, DNS search)
    Policy,
    /// `initContainers:`
    InitContainers,
    /// `containers:`
    Containers,
    /// `volumes:`
    Volumes,
}

impl SectionKind {
    /// Every section in output order
    pub const ALL: [SectionKind; 4] = [
        SectionKind::Policy,
        SectionKind::InitContainers,
        SectionKind::Containers,
        SectionKind::Volumes,
    ];
}

/// Whether pods are injected unless they opt out
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InjectionPolicy {
    /// Inject by default
    Enabled,
    /// Inject only on request
    Disabled,
}

impl InjectionPolicy {
    /// Policy from a resolved flag
    pub fn from_flag(enabled: bool) -> Self {
        if enabled {
            Self::Enabled
        } else {
            Self::Disabled
        }
    }
}

/// The payload stored for the admission webhook
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectorConfig {
    /// Default injection policy
    pub policy: InjectionPolicy,
    /// Phase-2 template text
    pub template: String,
}

/// Output of one synthesis run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SynthesizedArtifact {
    policy: InjectionPolicy,
    sections: Vec<(SectionKind, Fragment)>,
}

impl SynthesizedArtifact {
    /// Assemble an artifact; sections must arrive in [`SectionKind::ALL`] order
    pub(crate) fn new(policy: InjectionPolicy, sections: Vec<(SectionKind, Fragment)>) -> Self {
        debug_assert!(sections.windows(2).all(|w| w[0].0 < w[1].0));
        Self { policy, sections }
    }

    /// Default injection policy
    pub fn policy(&self) -> InjectionPolicy {
        self.policy
    }

    /// One section of the template
    pub fn section(&self, kind: SectionKind) -> Option<&Fragment> {
        self.sections
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, fragment)| fragment)
    }

    /// Every lookup in the template, in template order
    pub fn lookups(&self) -> Vec<&Lookup> {
        self.sections
            .iter()
            .flat_map(|(_, fragment)| fragment.lookups())
            .collect()
    }

    /// The full template text
    pub fn template(&self) -> String {
        self.sections
            .iter()
            .map(|(_, fragment)| fragment.to_string())
            .collect()
    }

    /// The stored payload
    pub fn config(&self) -> InjectorConfig {
        InjectorConfig {
            policy: self.policy,
            template: self.template(),
        }
    }

    /// The stored payload as YAML
    pub fn envelope(&self) -> Result<String, SynthesisError> {
        serde_yaml::to_string(&self.config())
            .map_err(|e| SynthesisError::serialization("injector config", e))
    }
}
