use provsign::audit::{self, AuditConfig, LogDestination};
use provsign::certificate::{
    Certificate, CertificateIssuer, IssuingAuthority, SubjectAttributes,
};
use provsign::codec::{format_from_extension, sniff_format, TrailerCodec};
use provsign::config::PipelineConfig;
use provsign::keys::{KeyManager, KeyType, UserAuthorization};
use provsign::manifest::CaptureContext;
use provsign::metrics::global_metrics;
use provsign::sanitize::RawMetadata;
use provsign::signing::{SigningOrchestrator, SigningRequest, SigningResult};
use provsign::time::{SystemTimeSource, TimeSource};
use provsign::trust::list::TrustList;
use provsign::trust::{TrustEvaluator, TrustStoreRegistry};
use provsign::verify::{TrustLevel, Verifier};
use provsign::PSError;

use provsign::reexports::log;

use clap::{Arg, ArgAction, ArgMatches, Command, crate_description, crate_name, crate_version};
use std::fs::File;
use std::io::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Helper function to create a file with parent directories
fn create_file_with_dirs(path: impl AsRef<Path>) -> Result<File, PSError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            PSError::InternalError(format!(
                "Failed to create parent directory for '{}': {}",
                path.display(),
                e
            ))
        })?;
    }
    File::create(path).map_err(|e| {
        PSError::InternalError(format!("Failed to create file '{}': {}", path.display(), e))
    })
}

fn read_to_string(path: impl AsRef<Path>) -> Result<String, PSError> {
    let path = path.as_ref();
    std::fs::read_to_string(path).map_err(|e| {
        PSError::InternalError(format!("Failed to read file '{}': {}", path.display(), e))
    })
}

fn asset_arg() -> Arg {
    Arg::new("in")
        .value_name("asset")
        .long("input-file")
        .short('i')
        .required(true)
        .help("Asset file")
}

fn subject_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("common_name")
                .long("common-name")
                .value_name("name")
                .help("Certificate subject common name"),
        )
        .arg(
            Arg::new("organization")
                .long("organization")
                .value_name("org")
                .help("Certificate subject organization"),
        )
        .arg(
            Arg::new("issuer_cert")
                .long("issuer-cert")
                .value_name("pem_file")
                .requires("issuer_key")
                .help("Have the certificate issued by this CA instead of self-signing"),
        )
        .arg(
            Arg::new("issuer_key")
                .long("issuer-key")
                .value_name("pem_file")
                .requires("issuer_cert")
                .help("Private key of the issuing CA"),
        )
}

fn start() -> Result<(), PSError> {
    let matches = Command::new(crate_name!())
        .version(crate_version!())
        .about(crate_description!())
        .arg(
            Arg::new("verbose")
                .short('v')
                .action(ArgAction::SetTrue)
                .help("Verbose output"),
        )
        .arg(
            Arg::new("debug")
                .short('d')
                .action(ArgAction::SetTrue)
                .help("Prints debugging information"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .value_name("FILE")
                .help("JSON configuration file"),
        )
        .arg(
            Arg::new("data-dir")
                .long("data-dir")
                .value_name("DIR")
                .help("Directory for the identity record and trust-list state"),
        )
        .arg(
            Arg::new("audit")
                .long("audit")
                .action(ArgAction::SetTrue)
                .help("Enable structured audit logging (JSON to stderr)"),
        )
        .arg(
            Arg::new("audit-file")
                .long("audit-file")
                .value_name("FILE")
                .help("Write audit logs to FILE instead of stderr"),
        )
        .arg(
            Arg::new("metrics")
                .long("metrics")
                .action(ArgAction::SetTrue)
                .help("Print pipeline metrics in Prometheus format on exit"),
        )
        .subcommand(subject_args(
            Command::new("init").about("Create the signing identity and its certificate"),
        ))
        .subcommand(subject_args(
            Command::new("cert")
                .about("Show the signing certificate, or issue a new one")
                .arg(
                    Arg::new("reissue")
                        .long("reissue")
                        .action(ArgAction::SetTrue)
                        .help("Issue a new certificate for the current key"),
                )
                .arg(
                    Arg::new("pem")
                        .long("pem")
                        .action(ArgAction::SetTrue)
                        .help("Print the certificate as PEM"),
                ),
        ))
        .subcommand(
            Command::new("sign")
                .about("Sign one or more assets")
                .arg(
                    Arg::new("in")
                        .value_name("asset")
                        .long("input-file")
                        .short('i')
                        .required(true)
                        .action(ArgAction::Append)
                        .help("Asset file (repeat for a batch)"),
                )
                .arg(
                    Arg::new("out")
                        .value_name("output_file")
                        .long("output-file")
                        .short('o')
                        .help("Write the signed asset here instead of in place (single asset only)"),
                )
                .arg(
                    Arg::new("metadata")
                        .long("metadata")
                        .short('m')
                        .value_name("json_file")
                        .help("Capture metadata as a JSON object"),
                )
                .arg(
                    Arg::new("title")
                        .long("title")
                        .value_name("title")
                        .help("Asset title (defaults to the file name)"),
                )
                .arg(
                    Arg::new("format")
                        .long("format")
                        .value_name("mime_type")
                        .help("Asset MIME type (detected when omitted)"),
                )
                .arg(
                    Arg::new("captured_at")
                        .long("captured-at")
                        .value_name("rfc3339")
                        .help("Capture time (defaults to now)"),
                )
                .arg(
                    Arg::new("include_gps")
                        .long("include-gps")
                        .action(ArgAction::SetTrue)
                        .help("Keep location fields in the manifest"),
                ),
        )
        .subcommand(
            Command::new("verify")
                .about("Verify an asset's content credentials")
                .arg(asset_arg())
                .arg(
                    Arg::new("remote")
                        .long("remote")
                        .action(ArgAction::SetTrue)
                        .help("Check the signing certificate against the trust list"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print the validation result as JSON"),
                ),
        )
        .subcommand(
            Command::new("export-key")
                .about("Export the public key")
                .arg(
                    Arg::new("consent")
                        .long("consent")
                        .action(ArgAction::SetTrue)
                        .help("Confirm the export"),
                )
                .arg(
                    Arg::new("private")
                        .long("private")
                        .action(ArgAction::SetTrue)
                        .help("Request the private key (always refused)"),
                )
                .arg(
                    Arg::new("out")
                        .value_name("output_file")
                        .long("output-file")
                        .short('o')
                        .help("Write the PEM public key to a file"),
                ),
        )
        .subcommand(subject_args(
            Command::new("rotate").about("Replace the signing key and issue a new certificate"),
        ))
        .subcommand(Command::new("policy").about("Show the key rotation policy"))
        .subcommand(
            Command::new("trust-report")
                .about("Evaluate the signing certificate against each trust strategy")
                .arg(
                    Arg::new("root_program")
                        .long("root-program")
                        .value_name("name=pem_file")
                        .action(ArgAction::Append)
                        .help("Root-program trust store"),
                )
                .arg(
                    Arg::new("commercial")
                        .long("commercial")
                        .value_name("name=pem_file")
                        .action(ArgAction::Append)
                        .help("Commercial CA trust store"),
                ),
        )
        .subcommand(
            Command::new("trust-list")
                .about("Manage the remote trust-list state")
                .subcommand_required(true)
                .subcommand(Command::new("refresh").about("Fetch the latest trust-list metadata"))
                .subcommand(Command::new("pending").about("List verifications awaiting a trust verdict"))
                .subcommand(Command::new("retry").about("Retry pending verifications")),
        )
        .subcommand(
            Command::new("delete-identity")
                .about("Delete the signing identity and every key it owns")
                .arg(
                    Arg::new("yes")
                        .long("yes")
                        .action(ArgAction::SetTrue)
                        .help("Confirm the deletion"),
                ),
        )
        .get_matches();

    let verbose = matches.get_flag("verbose");
    let debug = matches.get_flag("debug");
    let audit_enabled = matches.get_flag("audit");
    let audit_file = matches.get_one::<String>("audit-file").map(|s| s.as_str());

    env_logger::builder()
        .format_timestamp(None)
        .format_level(false)
        .format_module_path(false)
        .format_target(false)
        .filter_level(if debug {
            log::LevelFilter::Debug
        } else if verbose {
            log::LevelFilter::Info
        } else {
            log::LevelFilter::Warn
        })
        .init();

    if audit_enabled || audit_file.is_some() {
        let destination = match audit_file {
            Some(path) => LogDestination::File(path.to_string()),
            None => LogDestination::Stderr,
        };
        audit::init(AuditConfig {
            destination,
            ..AuditConfig::default()
        })?;
    }

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    }
    .apply_env_overrides()?;
    if let Some(dir) = matches.get_one::<String>("data-dir") {
        config = config.with_data_dir(dir);
    }

    let time: Arc<dyn TimeSource> = Arc::new(SystemTimeSource);

    if let Some(matches) = matches.subcommand_matches("init") {
        let keys = KeyManager::from_config(&config)?;
        let key_pair = keys.ensure_key_pair()?;
        println!("* Signing key: {}", key_pair.key_id());
        if config.certificate_path().exists() {
            println!("* Certificate already present at {}", config.certificate_path().display());
        } else {
            let cert = issue_certificate(&config, &keys, matches)?;
            println!("* Certificate {} written to {}", cert.fingerprint(), config.certificate_path().display());
        }
    } else if let Some(matches) = matches.subcommand_matches("cert") {
        let cert = if matches.get_flag("reissue") {
            let keys = KeyManager::from_config(&config)?;
            issue_certificate(&config, &keys, matches)?
        } else {
            load_certificate(&config)?
        };
        if matches.get_flag("pem") {
            print!("{}", cert.to_pem());
        } else {
            show_certificate(&cert, time.now_unix()? as i64);
        }
    } else if let Some(matches) = matches.subcommand_matches("sign") {
        let inputs: Vec<&String> = matches
            .get_many::<String>("in")
            .ok_or(PSError::UsageError("Missing input file"))?
            .collect();
        let output_file = matches.get_one::<String>("out");
        if output_file.is_some() && inputs.len() > 1 {
            return Err(PSError::UsageError("--output-file only applies to a single asset"));
        }
        if matches.get_flag("include_gps") {
            config.sanitization.remove_gps = false;
        }

        let metadata = match matches.get_one::<String>("metadata") {
            Some(path) => {
                let value: serde_json::Value = serde_json::from_str(&read_to_string(path)?)?;
                RawMetadata::from_json(&value)?
            }
            None => RawMetadata::new(),
        };
        let captured_at = match matches.get_one::<String>("captured_at") {
            Some(ts) => chrono::DateTime::parse_from_rfc3339(ts)
                .map_err(|e| PSError::TimeError(format!("Invalid capture time '{}': {}", ts, e)))?
                .with_timezone(&chrono::Utc),
            None => time.now_utc()?,
        };

        let mut requests = Vec::with_capacity(inputs.len());
        for input in &inputs {
            let path = PathBuf::from(input);
            let format = match matches.get_one::<String>("format") {
                Some(format) => format.clone(),
                None => detect_format(&path)?,
            };
            let title = match matches.get_one::<String>("title") {
                Some(title) => title.clone(),
                None => path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or(PSError::UsageError("Asset path has no file name"))?,
            };
            let context = CaptureContext::new(title, format, captured_at);
            let mut request = SigningRequest::new(path, metadata.clone(), context);
            if let Some(out) = output_file {
                request = request.with_output(out);
            }
            requests.push(request);
        }

        let keys = Arc::new(KeyManager::from_config(&config)?);
        let mut orchestrator = SigningOrchestrator::from_config(&config, keys);
        if config.certificate_path().exists() {
            orchestrator = orchestrator.with_certificate(load_certificate(&config)?);
        } else {
            log::warn!("No certificate found, manifests will carry the bare public key");
        }

        let results = orchestrator.sign_batch(&requests, config.signing.workers);
        let mut failed = false;
        for (request, result) in requests.iter().zip(results) {
            match result? {
                SigningResult::Success {
                    strategy,
                    artifact,
                    manifest,
                } => {
                    println!("✓ {} signed ({})", request.asset.display(), strategy);
                    println!("  Manifest: {}", artifact.display());
                    if verbose {
                        println!("  Instance: {}", manifest.claim().instance_id);
                        println!("  Assertions: {}", manifest.labels().join(", "));
                    }
                }
                SigningResult::Failure { errors } => {
                    failed = true;
                    println!("✗ {} not signed", request.asset.display());
                    for error in errors {
                        println!("  {}", error);
                    }
                }
            }
        }
        if failed {
            return Err(PSError::InternalError("Some assets could not be signed".to_string()));
        }
    } else if let Some(matches) = matches.subcommand_matches("verify") {
        let input_file = matches
            .get_one::<String>("in")
            .ok_or(PSError::UsageError("Missing input file"))?;
        let remote = matches.get_flag("remote");
        let mut verifier = Verifier::new(Arc::new(TrailerCodec::new()))
            .with_time_source(Arc::clone(&time))
            .with_expiry_warning_days(config.certificate.expiry_warning_days);
        if remote {
            verifier = verifier.with_trust_list(Arc::new(TrustList::from_config(&config, Arc::clone(&time))));
        }
        let result = verifier.verify_with_trust_list(Path::new(input_file), remote)?;

        if matches.get_flag("json") {
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else {
            println!("Trust level: {}", result.trust_level);
            println!("Source: {}", result.source.label());
            if let Some(fingerprint) = &result.certificate_fingerprint {
                println!("Certificate: {}", fingerprint);
            }
            for error in &result.errors {
                println!("  error: {}", error);
            }
            for warning in &result.warnings {
                println!("  warning: {}", warning);
            }
        }
        if let Some(error) = result.errors.first() {
            return Err(error.to_error());
        }
        if result.trust_level >= TrustLevel::Unknown {
            println!("Manifest is valid.");
        }
    } else if let Some(matches) = matches.subcommand_matches("export-key") {
        let keys = KeyManager::from_config(&config)?;
        if matches.get_flag("private") {
            // Always refused, consent or not
            keys.export_key(KeyType::Private, matches.get_flag("consent"));
            return Err(PSError::UsageError("Private keys are never exported"));
        }
        let bytes = keys
            .export_key(KeyType::Public, matches.get_flag("consent"))
            .ok_or(PSError::AuthorizationRequired(
                "pass --consent to export the public key".to_string(),
            ))?;
        let pem = provsign::keys::PublicKey::from_bytes(&bytes)?.to_pem();
        match matches.get_one::<String>("out") {
            Some(path) => create_file_with_dirs(path)?.write_all(pem.as_bytes())?,
            None => print!("{}", pem),
        }
    } else if let Some(matches) = matches.subcommand_matches("rotate") {
        let keys = KeyManager::from_config(&config)?;
        let previous = keys.current_key_pair()?.map(|kp| kp.key_id());
        let key_pair = keys.rotate()?;
        if let Some(previous) = previous {
            println!("* Superseded key: {}", previous);
        }
        println!("* New signing key: {}", key_pair.key_id());
        let cert = issue_certificate(&config, &keys, matches)?;
        println!("* Certificate {} written to {}", cert.fingerprint(), config.certificate_path().display());
    } else if matches.subcommand_matches("policy").is_some() {
        let keys = KeyManager::from_config(&config)?;
        let policy = keys.rotation_policy()?;
        println!("Rotation interval: {} months", policy.interval_months);
        match policy.last_rotation {
            Some(last) => println!("Last rotation: {}", last.to_rfc3339()),
            None => println!("Last rotation: never"),
        }
        if let Some(next) = policy.next_rotation {
            let due = if policy.is_due(time.now_utc()?) { " (due)" } else { "" };
            println!("Next rotation: {}{}", next.to_rfc3339(), due);
        }
        println!("Revocation procedure: {}", if policy.has_revocation_procedure { "yes" } else { "no" });
    } else if let Some(matches) = matches.subcommand_matches("trust-report") {
        let cert = load_certificate(&config)?;
        let mut registry = TrustStoreRegistry::new();
        let root_programs = load_trust_stores(&mut registry, matches, "root_program")?;
        let commercial = load_trust_stores(&mut registry, matches, "commercial")?;
        let evaluator = TrustEvaluator::with_registry(Arc::new(registry), root_programs, commercial);

        let now = time.now_unix()?;
        for evaluation in evaluator.report(&cert, now) {
            let mark = if evaluation.achievable { "✓" } else { "-" };
            println!(
                "{} {} ({}% of {}%)",
                mark, evaluation.strategy, evaluation.trust_level_percentage, evaluation.potential_percentage
            );
            println!("    {}", evaluation.detail);
            if verbose {
                println!("    Cost: {}, timeline: {}", evaluation.cost, evaluation.timeline);
                for step in &evaluation.implementation_steps {
                    println!("    - {}", step);
                }
            }
        }
        match evaluator.recommend_strategy(&cert, now) {
            Some(best) => println!("\nCurrent strategy: {}", best.strategy),
            None => println!("\nNo trust strategy is currently in place"),
        }
    } else if let Some(matches) = matches.subcommand_matches("trust-list") {
        let trust_list = TrustList::from_config(&config, Arc::clone(&time));
        if matches.subcommand_matches("refresh").is_some() {
            match trust_list.refresh_trust_list()? {
                provsign::trust::cache::RefreshOutcome::Refreshed(metadata) => {
                    println!("Trust list version {}", metadata.version)
                }
                provsign::trust::cache::RefreshOutcome::AlreadyInProgress => {
                    println!("A refresh is already in progress")
                }
            }
        } else if matches.subcommand_matches("pending").is_some() {
            for entry in trust_list.pending().entries() {
                println!("{} {} ({})", entry.fingerprint, entry.asset, entry.reason);
            }
        } else if matches.subcommand_matches("retry").is_some() {
            let summary = trust_list.retry_pending()?;
            println!("Resolved: {}, still pending: {}", summary.resolved, summary.still_pending);
        }
    } else if let Some(matches) = matches.subcommand_matches("delete-identity") {
        let authorization = if matches.get_flag("yes") {
            UserAuthorization::Confirmed
        } else {
            UserAuthorization::Declined
        };
        let keys = KeyManager::from_config(&config)?;
        keys.delete_identity(authorization)?;
        let cert_path = config.certificate_path();
        if cert_path.exists() {
            std::fs::remove_file(&cert_path)?;
        }
        println!("Signing identity deleted.");
    } else {
        return Err(PSError::UsageError("No subcommand specified"));
    }

    if matches.get_flag("metrics") {
        print!("{}", global_metrics().export_prometheus("provsign"));
    }
    Ok(())
}

fn detect_format(path: &Path) -> Result<String, PSError> {
    let format = match sniff_format(path)? {
        Some(format) => Some(format),
        None => format_from_extension(path),
    };
    format
        .map(str::to_string)
        .ok_or_else(|| PSError::UnsupportedFormat(format!("cannot detect format of {}", path.display())))
}

fn subject_from(config: &PipelineConfig, matches: &ArgMatches) -> SubjectAttributes {
    let mut subject = SubjectAttributes::from_config(&config.certificate);
    if let Some(cn) = matches.get_one::<String>("common_name") {
        subject = SubjectAttributes {
            common_name: cn.clone(),
            ..subject
        };
    }
    if let Some(org) = matches.get_one::<String>("organization") {
        subject = subject.with_organization(org);
    }
    subject
}

/// Issue a certificate for the current key and store it as PEM.
fn issue_certificate(
    config: &PipelineConfig,
    keys: &KeyManager,
    matches: &ArgMatches,
) -> Result<Certificate, PSError> {
    let signer = keys.signer()?;
    let subject = subject_from(config, matches);
    let issuer = CertificateIssuer::new(&config.certificate);
    let cert = match (
        matches.get_one::<String>("issuer_cert"),
        matches.get_one::<String>("issuer_key"),
    ) {
        (Some(cert_file), Some(key_file)) => {
            let authority = IssuingAuthority::from_pem(&read_to_string(cert_file)?, &read_to_string(key_file)?)?;
            issuer.generate_cross_signed_certificate(&signer, &subject, &authority)?
        }
        _ => issuer.generate_self_signed_certificate(&signer, &subject)?,
    };
    provsign::secure_file::write_atomic(&config.certificate_path(), cert.to_pem().as_bytes())?;
    Ok(cert)
}

fn load_certificate(config: &PipelineConfig) -> Result<Certificate, PSError> {
    let path = config.certificate_path();
    if !path.exists() {
        return Err(PSError::UsageError("No certificate yet, run `provsign init`"));
    }
    Certificate::from_pem(&read_to_string(path)?)
}

fn show_certificate(cert: &Certificate, now: i64) {
    println!("Subject: {}", cert.subject);
    println!("Issuer: {}", cert.issuer);
    println!("Serial: {}", cert.serial_number);
    if cert.serial_degraded {
        println!("  (timestamp-derived serial)");
    }
    println!("Fingerprint: {}", cert.fingerprint());
    println!("Key: {}", cert.public_key.key_id());
    println!("Self-signed: {}", cert.self_signed);
    println!("Key usage: {}", cert.key_usage.join(", "));
    println!("Extended key usage: {}", cert.extended_key_usage.join(", "));
    if cert.is_expired_at(now) {
        println!("Expired");
    } else {
        println!("Valid for {} more days", cert.remaining_secs(now) / 86_400);
    }
}

/// Load `name=file` trust stores into `registry` and return their names.
fn load_trust_stores(
    registry: &mut TrustStoreRegistry,
    matches: &ArgMatches,
    arg: &str,
) -> Result<Vec<String>, PSError> {
    let mut names = Vec::new();
    for spec in matches.get_many::<String>(arg).into_iter().flatten() {
        let (name, file) = spec
            .split_once('=')
            .ok_or(PSError::UsageError("Trust stores are given as name=pem_file"))?;
        let count = registry.load_pem_file(name, file)?;
        log::info!("Loaded {} anchors for {}", count, name);
        names.push(name.to_string());
    }
    Ok(names)
}

fn main() -> Result<(), PSError> {
    let res = start();
    match res {
        Ok(_) => {}
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
    Ok(())
}
