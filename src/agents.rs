//! Specialist agents.
//!
//! Each agent is a tagged variant driving prompt assembly: adding a new
//! specialist is one variant plus one prompt template. Tool bindings and
//! domain logic live outside this crate.

use serde::{Deserialize, Serialize};

/// The specialist that handles a classified query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Documentation,
    Troubleshooting,
    Maintenance,
}

impl AgentKind {
    pub const ALL: [AgentKind; 3] = [
        AgentKind::Documentation,
        AgentKind::Troubleshooting,
        AgentKind::Maintenance,
    ];

    /// The default specialist when nothing better is known.
    pub const DEFAULT: AgentKind = AgentKind::Documentation;

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Documentation => "documentation",
            AgentKind::Troubleshooting => "troubleshooting",
            AgentKind::Maintenance => "maintenance",
        }
    }

    pub fn parse(s: &str) -> Option<AgentKind> {
        match s.trim().to_lowercase().as_str() {
            "documentation" => Some(AgentKind::Documentation),
            "troubleshooting" => Some(AgentKind::Troubleshooting),
            "maintenance" => Some(AgentKind::Maintenance),
            _ => None,
        }
    }

    /// Human-facing agent name, used in query responses.
    pub fn display_name(&self) -> &'static str {
        match self {
            AgentKind::Documentation => "Documentation Assistant",
            AgentKind::Troubleshooting => "Troubleshooting Advisor",
            AgentKind::Maintenance => "Maintenance Procedures Specialist",
        }
    }

    /// One-line capability summary, fed to the classifier prompt.
    pub fn capability(&self) -> &'static str {
        match self {
            AgentKind::Documentation => {
                "locates and explains content from aircraft manuals, service bulletins, \
                 airworthiness directives and regulatory documents"
            }
            AgentKind::Troubleshooting => {
                "diagnoses reported faults, interprets symptoms and error codes, and \
                 walks through fault-isolation decision trees"
            }
            AgentKind::Maintenance => {
                "produces step-by-step maintenance procedures, part replacement \
                 instructions, torque values and sign-off requirements"
            }
        }
    }

    /// System-prompt preamble for this specialist.
    pub fn preamble(&self) -> &'static str {
        match self {
            AgentKind::Documentation => {
                "You are the documentation assistant for an aircraft maintenance \
                 organization. Answer from the perspective of published manuals and \
                 regulatory documents. Cite the document type you are drawing on \
                 (AMM, IPC, SRM, service bulletin) when it is identifiable. If the \
                 question is outside documented material, say so plainly."
            }
            AgentKind::Troubleshooting => {
                "You are the troubleshooting advisor for an aircraft maintenance \
                 organization. Reason from symptoms toward probable causes, ordered \
                 by likelihood. Ask for the single most discriminating observation \
                 when the fault is ambiguous. Never invent fault codes."
            }
            AgentKind::Maintenance => {
                "You are the maintenance procedures specialist for an aircraft \
                 maintenance organization. Produce numbered, executable steps with \
                 required tooling, consumables, torque values and safety notes. \
                 Flag every step that requires an inspector sign-off."
            }
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
