//! Trust management
//!
//! Two separate questions live here:
//!
//! - *How widely could this certificate be trusted?* Answered by the ranked
//!   [`TrustStrategy`] list and the [`TrustEvaluator`]. The answer is
//!   descriptive (steps, cost, timeline) and feeds reporting.
//! - *Is this certificate trusted right now?* Answered by path validation
//!   against a named store ([`TrustStoreRegistry`]) and by the remote trust
//!   list ([`list::TrustList`]).
//!
//! An evaluation that cannot be completed is reported as not achievable,
//! never as trusted.

pub mod cache;
pub mod list;
pub mod pending;
mod registry;

pub use registry::TrustStoreRegistry;

use crate::certificate::Certificate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Ways a signing certificate can gain relying-party trust, best first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustStrategy {
    RootProgramInclusion,
    CommercialCrossSign,
    IntermediateChain,
    SelfSigned,
}

impl TrustStrategy {
    /// Strategies in preference order.
    pub const RANKED: [TrustStrategy; 4] = [
        TrustStrategy::RootProgramInclusion,
        TrustStrategy::CommercialCrossSign,
        TrustStrategy::IntermediateChain,
        TrustStrategy::SelfSigned,
    ];

    /// Position in [`Self::RANKED`]; lower is better.
    pub fn rank(&self) -> usize {
        match self {
            TrustStrategy::RootProgramInclusion => 0,
            TrustStrategy::CommercialCrossSign => 1,
            TrustStrategy::IntermediateChain => 2,
            TrustStrategy::SelfSigned => 3,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TrustStrategy::RootProgramInclusion => "root_program_inclusion",
            TrustStrategy::CommercialCrossSign => "commercial_cross_sign",
            TrustStrategy::IntermediateChain => "intermediate_chain",
            TrustStrategy::SelfSigned => "self_signed",
        }
    }

    /// Upper bound on relying-party coverage once the strategy is in place.
    fn coverage_percentage(&self) -> u8 {
        match self {
            TrustStrategy::RootProgramInclusion => 95,
            TrustStrategy::CommercialCrossSign => 85,
            TrustStrategy::IntermediateChain => 40,
            TrustStrategy::SelfSigned => 5,
        }
    }

    fn cost(&self) -> &'static str {
        match self {
            TrustStrategy::RootProgramInclusion => "High: audited CA operation and annual program fees",
            TrustStrategy::CommercialCrossSign => "Medium: per-certificate fee to a commercial CA",
            TrustStrategy::IntermediateChain => "Low: operate a private CA",
            TrustStrategy::SelfSigned => "None",
        }
    }

    fn timeline(&self) -> &'static str {
        match self {
            TrustStrategy::RootProgramInclusion => "12-24 months",
            TrustStrategy::CommercialCrossSign => "2-8 weeks",
            TrustStrategy::IntermediateChain => "1-2 weeks",
            TrustStrategy::SelfSigned => "Immediate",
        }
    }

    fn implementation_steps(&self) -> Vec<String> {
        let steps: &[&str] = match self {
            TrustStrategy::RootProgramInclusion => &[
                "Stand up an audited root CA with claim-signing key usage",
                "Pass a WebTrust or ETSI audit",
                "Apply to each platform root program and trust list",
                "Re-issue signing certificates under the included root",
            ],
            TrustStrategy::CommercialCrossSign => &[
                "Select a commercial CA that issues claim-signing certificates",
                "Submit the signing public key for validation",
                "Install the issued certificate and its chain",
            ],
            TrustStrategy::IntermediateChain => &[
                "Create a private root and intermediate CA",
                "Issue the signing certificate from the intermediate",
                "Distribute the root to relying parties out of band",
            ],
            TrustStrategy::SelfSigned => &[
                "Generate a self-signed certificate for the signing key",
                "Publish the certificate fingerprint for manual pinning",
            ],
        };
        steps.iter().map(|s| s.to_string()).collect()
    }
}

impl fmt::Display for TrustStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Descriptive trust assessment for one strategy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustEvaluation {
    pub strategy: TrustStrategy,
    /// Coverage actually reached now, 0 when not achievable
    pub trust_level_percentage: u8,
    /// Coverage once the strategy is completed
    pub potential_percentage: u8,
    pub achievable: bool,
    pub implementation_steps: Vec<String>,
    pub cost: String,
    pub timeline: String,
    /// Why the strategy is or is not in place
    pub detail: String,
}

/// One trust provider, tagged by the strategy it answers for
pub enum TrustProvider {
    /// The certificate chains to an anchor in one of the listed root-program
    /// stores.
    RootProgram {
        registry: Arc<TrustStoreRegistry>,
        platforms: Vec<String>,
    },
    /// The certificate was issued by a commercial CA present in one of the
    /// listed stores.
    CommercialCrossSign {
        registry: Arc<TrustStoreRegistry>,
        platforms: Vec<String>,
    },
    /// The certificate is issued by a private CA the relying party may add
    /// by hand.
    IntermediateChain,
    /// The certificate signs itself.
    SelfSigned,
}

impl TrustProvider {
    pub fn strategy(&self) -> TrustStrategy {
        match self {
            TrustProvider::RootProgram { .. } => TrustStrategy::RootProgramInclusion,
            TrustProvider::CommercialCrossSign { .. } => TrustStrategy::CommercialCrossSign,
            TrustProvider::IntermediateChain => TrustStrategy::IntermediateChain,
            TrustProvider::SelfSigned => TrustStrategy::SelfSigned,
        }
    }

    /// Whether the strategy is in place for `certificate`, with a reason.
    fn assess(&self, certificate: &Certificate, unix_secs: u64) -> (bool, String) {
        match self {
            TrustProvider::RootProgram {
                registry,
                platforms,
            }
            | TrustProvider::CommercialCrossSign {
                registry,
                platforms,
            } => {
                let trusting: Vec<&str> = platforms
                    .iter()
                    .map(String::as_str)
                    .filter(|p| registry.validate_against_trust_store(certificate, p, unix_secs))
                    .collect();
                if trusting.is_empty() {
                    (false, "No configured trust store accepts the chain".to_string())
                } else {
                    (true, format!("Trusted by {}", trusting.join(", ")))
                }
            }
            TrustProvider::IntermediateChain => {
                if certificate.self_signed {
                    (false, "Certificate is self-signed".to_string())
                } else {
                    (true, format!("Issued by {}", certificate.issuer))
                }
            }
            TrustProvider::SelfSigned => (
                true,
                format!("Pin fingerprint {}", certificate.fingerprint()),
            ),
        }
    }
}

/// Evaluates a certificate against a ranked set of providers
pub struct TrustEvaluator {
    providers: Vec<TrustProvider>,
}

impl Default for TrustEvaluator {
    fn default() -> Self {
        Self::new(vec![TrustProvider::IntermediateChain, TrustProvider::SelfSigned])
    }
}

impl TrustEvaluator {
    /// Providers are kept in [`TrustStrategy::RANKED`] order whatever the
    /// input order.
    pub fn new(mut providers: Vec<TrustProvider>) -> Self {
        providers.sort_by_key(|p| p.strategy().rank());
        Self { providers }
    }

    /// Root-program and commercial providers over `registry`, followed by
    /// the chain and self-signed fallbacks.
    pub fn with_registry(
        registry: Arc<TrustStoreRegistry>,
        root_programs: Vec<String>,
        commercial: Vec<String>,
    ) -> Self {
        Self::new(vec![
            TrustProvider::RootProgram {
                registry: Arc::clone(&registry),
                platforms: root_programs,
            },
            TrustProvider::CommercialCrossSign {
                registry,
                platforms: commercial,
            },
            TrustProvider::IntermediateChain,
            TrustProvider::SelfSigned,
        ])
    }

    /// Descriptive evaluation of one strategy.
    pub fn evaluate_trust(
        &self,
        certificate: &Certificate,
        strategy: TrustStrategy,
        unix_secs: u64,
    ) -> TrustEvaluation {
        let (achievable, detail) = match self.providers.iter().find(|p| p.strategy() == strategy) {
            Some(provider) => provider.assess(certificate, unix_secs),
            None => (false, "No provider configured".to_string()),
        };
        let (achievable, detail) = if achievable && !certificate.is_valid_at(unix_secs as i64) {
            (false, "Certificate is outside its validity window".to_string())
        } else {
            (achievable, detail)
        };

        TrustEvaluation {
            strategy,
            trust_level_percentage: if achievable {
                strategy.coverage_percentage()
            } else {
                0
            },
            potential_percentage: strategy.coverage_percentage(),
            achievable,
            implementation_steps: strategy.implementation_steps(),
            cost: strategy.cost().to_string(),
            timeline: strategy.timeline().to_string(),
            detail,
        }
    }

    /// Evaluation for every ranked strategy.
    pub fn report(&self, certificate: &Certificate, unix_secs: u64) -> Vec<TrustEvaluation> {
        TrustStrategy::RANKED
            .iter()
            .map(|s| self.evaluate_trust(certificate, *s, unix_secs))
            .collect()
    }

    /// Highest-ranked strategy currently in place, if any.
    pub fn recommend_strategy(
        &self,
        certificate: &Certificate,
        unix_secs: u64,
    ) -> Option<TrustEvaluation> {
        self.report(certificate, unix_secs)
            .into_iter()
            .find(|e| e.achievable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::{CertificateIssuer, IssuingAuthority, SubjectAttributes};
    use crate::config::CertificateConfig;
    use crate::keys::{KeyManager, KeySigner, MemoryIdentityStore};
    use crate::platform::software::SoftwareProvider;
    use crate::time::FixedTimeSource;

    const JAN_2026: u64 = 1_767_225_600;

    fn signer() -> KeySigner {
        let keys = KeyManager::with_provider(
            Arc::new(SoftwareProvider::new()),
            Box::new(MemoryIdentityStore::new()),
            Arc::new(FixedTimeSource::from_unix_secs(JAN_2026)),
        )
        .unwrap();
        keys.generate_key_pair().unwrap();
        keys.signer().unwrap()
    }

    fn issuer() -> CertificateIssuer {
        CertificateIssuer::new(&CertificateConfig::default())
            .with_time_source(Arc::new(FixedTimeSource::from_unix_secs(JAN_2026)))
    }

    #[test]
    fn test_ranking() {
        let ranks: Vec<usize> = TrustStrategy::RANKED.iter().map(|s| s.rank()).collect();
        assert_eq!(ranks, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_self_signed_recommendation() {
        let cert = issuer()
            .generate_self_signed_certificate(&signer(), &SubjectAttributes::new("Signer"))
            .unwrap();
        let evaluator = TrustEvaluator::default();

        let best = evaluator.recommend_strategy(&cert, JAN_2026 + 60).unwrap();
        assert_eq!(best.strategy, TrustStrategy::SelfSigned);

        let root = evaluator.evaluate_trust(&cert, TrustStrategy::RootProgramInclusion, JAN_2026 + 60);
        assert!(!root.achievable);
        assert_eq!(root.trust_level_percentage, 0);
        assert!(!root.implementation_steps.is_empty());
    }

    #[test]
    fn test_cross_signed_recommendation() {
        let time = FixedTimeSource::from_unix_secs(JAN_2026);
        let ca = IssuingAuthority::create_root(&SubjectAttributes::new("Commercial CA"), 3650, &time)
            .unwrap();
        let cert = issuer()
            .generate_cross_signed_certificate(&signer(), &SubjectAttributes::new("Signer"), &ca)
            .unwrap();

        let mut registry = TrustStoreRegistry::new();
        registry.add_anchor_der("commercial", ca.certificate_der()).unwrap();
        let evaluator = TrustEvaluator::with_registry(
            Arc::new(registry),
            vec!["os-root".to_string()],
            vec!["commercial".to_string()],
        );

        let best = evaluator.recommend_strategy(&cert, JAN_2026 + 60).unwrap();
        assert_eq!(best.strategy, TrustStrategy::CommercialCrossSign);
        assert!(best.trust_level_percentage > 50);
        assert!(best.detail.contains("commercial"));
    }

    #[test]
    fn test_expired_certificate_never_achievable() {
        let cert = issuer()
            .generate_self_signed_certificate(&signer(), &SubjectAttributes::new("Signer"))
            .unwrap();
        let later = JAN_2026 + 1000 * 86_400;
        assert!(TrustEvaluator::default().recommend_strategy(&cert, later).is_none());
    }
}
