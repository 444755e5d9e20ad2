//! External representation of a finished exploration.

use crate::{
    engine::{Cause, Finding, FindingKind, IncompleteReason, RunStatus, Stats, Witness},
    expr::smtlib::Script,
    util::format_u256,
    word::Word,
};
use serde::Serialize;
use std::fmt;

#[derive(Clone, Debug, Serialize)]
pub struct Report {
    pub complete: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub incomplete_reasons: Vec<IncompleteReason>,
    pub stats: Stats,
    pub findings: Vec<FindingReport>,
}

#[derive(Clone, Debug, Serialize)]
pub struct FindingReport {
    pub kind: FindingKind,
    pub cause: String,
    pub pc: usize,
    pub address: String,
    pub call_depth: usize,
    pub instruction_count: u64,
    pub fork_depth: usize,
    /// Each entry holds if it evaluates to a non-zero word.
    pub path_condition: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smtlib: Option<String>,
    pub witness: Option<Witness>,
    pub solver_confirmed: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<String>,
    /// Return or revert data as hex, if it is concrete.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

fn word_literal(w: &Word) -> String {
    match w {
        Word::Concrete(c) => format_u256(*c),
        Word::Symbolic(e) => e.to_string(),
    }
}

impl FindingReport {
    pub fn new(finding: &Finding, with_smtlib: bool) -> Self {
        let topics = match &finding.cause {
            Cause::Event { topics } => topics.iter().map(word_literal).collect(),
            _ => Vec::new(),
        };

        let data = match &finding.cause {
            Cause::Return { data: Some(d) } | Cause::Revert { data: Some(d) } => {
                Some(format!("0x{}", hex::encode(d)))
            }
            _ => None,
        };

        Self {
            kind: finding.kind,
            cause: finding.cause.to_string(),
            pc: finding.pc,
            address: format_u256(finding.address),
            call_depth: finding.call_depth,
            instruction_count: finding.instruction_count,
            fork_depth: finding.fork_depth,
            path_condition: finding.path_condition.iter().map(|c| c.to_string()).collect(),
            smtlib: with_smtlib.then(|| Script::new(&finding.path_condition).to_string()),
            witness: finding.witness.clone(),
            solver_confirmed: finding.solver_confirmed,
            topics,
            data,
        }
    }
}

impl Report {
    pub fn new(findings: &[Finding], status: &RunStatus, stats: Stats, with_smtlib: bool) -> Self {
        let incomplete_reasons = match status {
            RunStatus::Complete => Vec::new(),
            RunStatus::Incomplete(reasons) => reasons.iter().copied().collect(),
        };

        Self {
            complete: status.is_complete(),
            incomplete_reasons,
            stats,
            findings: findings
                .iter()
                .map(|f| FindingReport::new(f, with_smtlib))
                .collect(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn count(&self, kind: FindingKind) -> usize {
        self.findings.iter().filter(|f| f.kind == kind).count()
    }
}

impl fmt::Display for FindingReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{} at pc {:#x}: {}", self.kind, self.pc, self.cause)?;
        writeln!(
            f,
            "  {} instructions, {} forks, call depth {}",
            self.instruction_count, self.fork_depth, self.call_depth
        )?;

        if self.path_condition.is_empty() {
            writeln!(f, "  path condition: true")?;
        } else {
            writeln!(f, "  path condition:")?;
            for constraint in &self.path_condition {
                writeln!(f, "    {}", constraint)?;
            }
        }

        match &self.witness {
            Some(witness) if witness.is_empty() => writeln!(f, "  witness: any input")?,
            Some(witness) => {
                writeln!(f, "  witness:")?;
                for (input, value) in witness.iter() {
                    writeln!(f, "    {} = {}", input, format_u256(value))?;
                }
            }
            None => writeln!(f, "  witness: none")?,
        }

        if !self.solver_confirmed {
            writeln!(f, "  (solver-unconfirmed)")?;
        }

        if let Some(smtlib) = &self.smtlib {
            writeln!(f, "{}", smtlib)?;
        }

        Ok(())
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for finding in &self.findings {
            writeln!(f, "{}", finding)?;
        }

        let status = if self.complete { "complete" } else { "incomplete" };

        write!(
            f,
            "{} findings, {} states explored, {} forks, {} infeasible: run {}",
            self.findings.len(),
            self.stats.states_explored,
            self.stats.forks,
            self.stats.infeasible,
            status
        )?;

        for (i, reason) in self.incomplete_reasons.iter().enumerate() {
            write!(f, "{}{}", if i == 0 { " (" } else { ", " }, reason)?;
        }

        if !self.incomplete_reasons.is_empty() {
            write!(f, ")")?;
        }

        Ok(())
    }
}
