
use chrono::Utc;
use kegbrew::receipt::ReceiptDependency;
use kegbrew::{
    Action, CancellationToken, DependencyKind, MemoryFormulaStore, PackageSpec, Receipt,
    ResolveError, ResolveOptions, Resolver, SoftEdgePolicy, Version,
};
use std::collections::BTreeSet;
use test_helpers::{MockDownloader, formula, wget_store};

use DependencyKind::{Build, Optional, Recommended, Runtime};

fn specs(requests: &[&str]) -> Vec<PackageSpec> {
    requests.iter().map(|s| s.parse().unwrap()).collect()
}

fn resolve(
    store: &MemoryFormulaStore,
    requests: &[&str],
) -> Result<kegbrew::InstallationPlan, ResolveError> {
    Resolver::new(store, ResolveOptions::default()).resolve(&specs(requests), &[])
}

fn with_policy(policy: SoftEdgePolicy) -> ResolveOptions {
    ResolveOptions {
        soft_edge_policy: policy,
        ..Default::default()
    }
}

fn receipt(name: &str, version: &str) -> Receipt {
    Receipt {
        name: name.to_string(),
        version: Version::parse(version).unwrap(),
        variants: BTreeSet::new(),
        files: Vec::new(),
        links: Vec::new(),
        dependencies: Vec::<ReceiptDependency>::new(),
        installed_at: Utc::now(),
        installed_on_request: true,
    }
}

mod ordering {
    use super::*;

    #[test]
    fn test_wget_plan_order_and_retention() {
        let store = wget_store(&MockDownloader::new());
        let plan = resolve(&store, &["wget"]).unwrap();

        assert_eq!(plan.names(), vec!["pkg-config", "openssl@3", "wget"]);
        assert!(plan.is_topologically_ordered());

        let pkg_config = plan.get("pkg-config").unwrap();
        assert!(pkg_config.is_build_only());
        assert_eq!(pkg_config.action, Action::Install);

        let wget = plan.get("wget").unwrap();
        assert!(wget.requested && wget.retained);
        assert_eq!(wget.dependencies, vec![0, 1]);
        assert_eq!(wget.dependency_kinds, vec![Build, Runtime]);
        assert!(plan.get("openssl@3").unwrap().retained);
    }

    #[test]
    fn test_diamond_shares_one_node() {
        let store: MemoryFormulaStore = [
            formula("app", "1.0", &[("a", Runtime), ("b", Runtime)]),
            formula("a", "1.0", &[("c", Runtime)]),
            formula("b", "1.0", &[("c", Runtime)]),
            formula("c", "1.0", &[]),
        ]
        .into_iter()
        .collect();

        let plan = resolve(&store, &["app"]).unwrap();
        assert_eq!(plan.names(), vec!["c", "a", "b", "app"]);
        assert_eq!(plan.names().iter().filter(|n| **n == "c").count(), 1);
    }

    #[test]
    fn test_build_dependency_kept_when_also_requested() {
        let store = wget_store(&MockDownloader::new());
        let plan = resolve(&store, &["wget", "pkg-config"]).unwrap();

        let pkg_config = plan.get("pkg-config").unwrap();
        assert!(pkg_config.retained);
        assert!(pkg_config.requested);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let store: MemoryFormulaStore = [
            formula("app", "1.0", &[("z", Runtime), ("m", Build), ("a", Runtime)]),
            formula("z", "1.0", &[("a", Runtime)]),
            formula("m", "1.0", &[]),
            formula("a", "1.0", &[]),
        ]
        .into_iter()
        .collect();

        let first = resolve(&store, &["app"]).unwrap();
        for _ in 0..10 {
            assert_eq!(resolve(&store, &["app"]).unwrap().names(), first.names());
        }
        // Build edges are visited first
        assert_eq!(first.names(), vec!["m", "a", "z", "app"]);
    }

    #[test]
    fn test_cycle_reports_path() {
        let store: MemoryFormulaStore = [
            formula("a", "1.0", &[("b", Runtime)]),
            formula("b", "1.0", &[("a", Runtime)]),
        ]
        .into_iter()
        .collect();

        match resolve(&store, &["a"]) {
            Err(ResolveError::CircularDependency { cycle }) => {
                assert_eq!(cycle, vec!["a", "b", "a"]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }
}

mod versions {
    use super::*;

    #[test]
    fn test_highest_satisfying_version() {
        let store: MemoryFormulaStore = [
            formula("app", "1.0", &[("lib<2", Runtime)]),
            formula("lib", "1.0", &[]),
            formula("lib", "1.2", &[]),
            formula("lib", "2.0", &[]),
        ]
        .into_iter()
        .collect();

        let plan = resolve(&store, &["app"]).unwrap();
        assert_eq!(plan.get("lib").unwrap().version.as_str(), "1.2");
    }

    #[test]
    fn test_requirements_intersect_across_requesters() {
        let store: MemoryFormulaStore = [
            formula("a", "1.0", &[("lib>=1", Runtime)]),
            formula("b", "1.0", &[("lib<2", Runtime)]),
            formula("lib", "1.0", &[]),
            formula("lib", "1.5", &[]),
            formula("lib", "2.0", &[]),
        ]
        .into_iter()
        .collect();

        let plan = resolve(&store, &["a", "b"]).unwrap();
        assert_eq!(plan.get("lib").unwrap().version.as_str(), "1.5");
    }

    #[test]
    fn test_exact_request() {
        let store: MemoryFormulaStore = [formula("jq", "1.6", &[]), formula("jq", "1.7.1", &[])]
            .into_iter()
            .collect();
        let plan = resolve(&store, &["jq:1.6"]).unwrap();
        assert_eq!(plan.nodes()[0].version.as_str(), "1.6");
    }

    #[test]
    fn test_unknown_formula_suggests_names() {
        let store = wget_store(&MockDownloader::new());
        match resolve(&store, &["wgett"]) {
            Err(ResolveError::FormulaNotFound {
                name, suggestions, ..
            }) => {
                assert_eq!(name, "wgett");
                assert_eq!(suggestions.first().map(String::as_str), Some("wget"));
            }
            other => panic!("expected not found, got {:?}", other),
        }
    }

    #[test]
    fn test_backtracks_to_older_requester() {
        let store: MemoryFormulaStore = [
            formula("app", "1.0", &[("lib>=1", Runtime)]),
            formula("app", "2.0", &[("lib>=2", Runtime)]),
            formula("lib", "1.0", &[]),
        ]
        .into_iter()
        .collect();

        let plan = resolve(&store, &["app"]).unwrap();
        assert_eq!(plan.get("app").unwrap().version.as_str(), "1.0");
        assert_eq!(plan.get("lib").unwrap().version.as_str(), "1.0");
    }

    #[test]
    fn test_pinned_requester_cannot_backtrack() {
        let store: MemoryFormulaStore = [
            formula("app", "1.0", &[("lib>=1", Runtime)]),
            formula("app", "2.0", &[("lib>=2", Runtime)]),
            formula("lib", "1.0", &[]),
        ]
        .into_iter()
        .collect();

        match resolve(&store, &["app==2.0"]) {
            Err(ResolveError::VersionConflict {
                name, constraints, ..
            }) => {
                assert_eq!(name, "lib");
                assert_eq!(constraints.len(), 1);
                assert_eq!(constraints[0].chain, vec!["app"]);
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_backtrack_budget() {
        let store: MemoryFormulaStore = [
            formula("app", "1.0", &[("lib>=1", Runtime)]),
            formula("app", "2.0", &[("lib>=2", Runtime)]),
            formula("app", "3.0", &[("lib>=3", Runtime)]),
            formula("lib", "0.5", &[]),
        ]
        .into_iter()
        .collect();

        let options = ResolveOptions {
            max_backtracks: 1,
            ..Default::default()
        };
        assert!(matches!(
            Resolver::new(&store, options).resolve(&specs(&["app"]), &[]),
            Err(ResolveError::BacktrackLimit { .. })
        ));

        // With room to try everything the real conflict surfaces
        assert!(matches!(
            resolve(&store, &["app"]),
            Err(ResolveError::VersionConflict { .. })
        ));

        let no_backtracking = ResolveOptions {
            max_backtracks: 0,
            ..Default::default()
        };
        assert!(matches!(
            Resolver::new(&store, no_backtracking).resolve(&specs(&["app"]), &[]),
            Err(ResolveError::VersionConflict { .. })
        ));
    }
}

mod soft_edges {
    use super::*;

    fn store() -> MemoryFormulaStore {
        [
            formula(
                "curl",
                "8.8.0",
                &[("libidn2>=3", Recommended), ("gpgme", Optional)],
            ),
            formula("libidn2", "2.3.7", &[]),
            formula("gpgme", "1.23.2", &[]),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_warn_drops_and_records_edge() {
        let store = store();
        let plan = Resolver::new(&store, with_policy(SoftEdgePolicy::Warn))
            .resolve(&specs(&["curl"]), &[])
            .unwrap();

        assert_eq!(plan.names(), vec!["curl"]);
        assert_eq!(plan.dropped().len(), 1);
        assert_eq!(plan.dropped()[0].from, "curl");
        assert_eq!(plan.dropped()[0].to, "libidn2");
        assert_eq!(plan.dropped()[0].kind, Recommended);
    }

    #[test]
    fn test_drop_is_silent() {
        let store = store();
        let plan = Resolver::new(&store, with_policy(SoftEdgePolicy::Drop))
            .resolve(&specs(&["curl"]), &[])
            .unwrap();
        assert_eq!(plan.names(), vec!["curl"]);
        assert!(plan.dropped().is_empty());
    }

    #[test]
    fn test_strict_reports_conflict() {
        let store = store();
        let err = Resolver::new(&store, with_policy(SoftEdgePolicy::Strict))
            .resolve(&specs(&["curl"]), &[])
            .unwrap_err();
        assert!(matches!(err, ResolveError::VersionConflict { ref name, .. } if name == "libidn2"));
    }

    #[test]
    fn test_optional_followed_only_when_enabled() {
        let store = store();
        let plan = resolve(&store, &["curl[with-gpgme]"]).unwrap();
        assert_eq!(plan.names(), vec!["gpgme", "curl"]);
        assert!(plan.get("curl").unwrap().variants.contains("with-gpgme"));

        let plan = resolve(&store, &["curl"]).unwrap();
        assert!(plan.get("gpgme").is_none());
    }

    #[test]
    fn test_recommended_disabled_by_without() {
        let store: MemoryFormulaStore = [
            formula("curl", "8.8.0", &[("libidn2", Recommended)]),
            formula("libidn2", "2.3.7", &[]),
        ]
        .into_iter()
        .collect();

        assert_eq!(resolve(&store, &["curl"]).unwrap().names(), vec!["libidn2", "curl"]);
        let plan = resolve(&store, &["curl[without-libidn2]"]).unwrap();
        assert_eq!(plan.names(), vec!["curl"]);
        assert!(plan.dropped().is_empty());
    }

    #[test]
    fn test_older_requester_restores_soft_edge() {
        let store: MemoryFormulaStore = [
            formula(
                "viewer",
                "2.0",
                &[("codec>=2", Recommended), ("core==1.0", Runtime)],
            ),
            formula("viewer", "1.0", &[("codec>=1", Recommended), ("core", Runtime)]),
            formula("codec", "1.0", &[]),
            formula("core", "1.0", &[]),
            formula("core", "2.0", &[]),
        ]
        .into_iter()
        .collect();

        let plan = resolve(&store, &["viewer", "core>=2"]).unwrap();
        assert_eq!(plan.get("viewer").unwrap().version.as_str(), "1.0");
        assert_eq!(plan.get("core").unwrap().version.as_str(), "2.0");
        assert_eq!(plan.get("codec").unwrap().version.as_str(), "1.0");
        assert!(plan.dropped().is_empty());
        assert!(plan.is_topologically_ordered());
    }

    #[test]
    fn test_unknown_variant_is_conflict() {
        let store = store();
        assert!(matches!(
            resolve(&store, &["curl[with-kerberos]"]),
            Err(ResolveError::VersionConflict { .. })
        ));
    }
}

mod installed {
    use super::*;

    #[test]
    fn test_satisfying_receipt_is_skipped() {
        let store = wget_store(&MockDownloader::new());
        let installed = vec![receipt("openssl@3", "3.3.1")];
        let plan = Resolver::new(&store, ResolveOptions::default())
            .resolve(&specs(&["wget"]), &installed)
            .unwrap();

        assert_eq!(plan.get("openssl@3").unwrap().action, Action::Skip);
        assert_eq!(plan.get("wget").unwrap().action, Action::Install);
        assert_eq!(plan.changes().count(), 2);
    }

    #[test]
    fn test_outdated_receipt_is_upgraded() {
        let store = wget_store(&MockDownloader::new());
        let installed = vec![receipt("openssl@3", "1.1.1")];
        let plan = Resolver::new(&store, ResolveOptions::default())
            .resolve(&specs(&["wget"]), &installed)
            .unwrap();

        assert_eq!(
            plan.get("openssl@3").unwrap().action,
            Action::Upgrade {
                from: Version::parse("1.1.1").unwrap()
            }
        );
        assert_eq!(plan.get("openssl@3").unwrap().version.as_str(), "3.3.1");
    }

    #[test]
    fn test_latest_upgrades_older_install() {
        let store: MemoryFormulaStore = [formula("jq", "1.6", &[]), formula("jq", "1.7.1", &[])]
            .into_iter()
            .collect();
        let installed = vec![receipt("jq", "1.6")];
        let resolver = Resolver::new(&store, ResolveOptions::default());

        let plan = resolver.resolve(&specs(&["jq"]), &installed).unwrap();
        assert_eq!(plan.nodes()[0].action, Action::Skip);

        let plan = resolver.resolve(&specs(&["jq:latest"]), &installed).unwrap();
        assert!(matches!(plan.nodes()[0].action, Action::Upgrade { .. }));
        assert_eq!(plan.nodes()[0].version.as_str(), "1.7.1");
    }

    #[test]
    fn test_missing_variant_reinstalls_same_version() {
        let store: MemoryFormulaStore = [
            formula("curl", "8.8.0", &[("gpgme", Optional)]),
            formula("gpgme", "1.23.2", &[]),
        ]
        .into_iter()
        .collect();
        let installed = vec![receipt("curl", "8.8.0")];

        let plan = Resolver::new(&store, ResolveOptions::default())
            .resolve(&specs(&["curl[with-gpgme]"]), &installed)
            .unwrap();
        let curl = plan.get("curl").unwrap();
        assert_eq!(
            curl.action,
            Action::Upgrade {
                from: Version::parse("8.8.0").unwrap()
            }
        );
        assert_eq!(plan.get("gpgme").unwrap().action, Action::Install);
    }
}

mod conflicts {
    use super::*;

    fn conflicting(name: &str, version: &str, deps: &[(&str, DependencyKind)], with: &[&str]) -> kegbrew::Formula {
        let mut f = formula(name, version, deps);
        f.conflicts = with.iter().map(|s| s.to_string()).collect();
        f
    }

    fn conflict(name: &str, other: &str, installed: bool) -> ResolveError {
        ResolveError::Conflict {
            name: name.to_string(),
            other: other.to_string(),
            installed,
        }
    }

    #[test]
    fn test_conflicting_requests_rejected() {
        let store: MemoryFormulaStore = [
            conflicting("mawk", "1.3.4", &[], &["gawk"]),
            formula("gawk", "5.3.0", &[]),
        ]
        .into_iter()
        .collect();

        assert_eq!(
            resolve(&store, &["gawk", "mawk"]).unwrap_err(),
            conflict("mawk", "gawk", false)
        );
    }

    #[test]
    fn test_conflict_through_dependency() {
        let store: MemoryFormulaStore = [
            formula("app", "1.0", &[("gawk", Runtime)]),
            formula("gawk", "5.3.0", &[]),
            conflicting("mawk", "1.3.4", &[], &["gawk"]),
        ]
        .into_iter()
        .collect();

        let err = resolve(&store, &["app", "mawk"]).unwrap_err();
        assert_eq!(err, conflict("mawk", "gawk", false));
        assert_eq!(err.to_string(), "'mawk' conflicts with 'gawk'");
    }

    #[test]
    fn test_conflict_with_installed_package() {
        let store: MemoryFormulaStore = [
            conflicting("mawk", "1.3.4", &[], &["gawk"]),
            formula("gawk", "5.3.0", &[]),
        ]
        .into_iter()
        .collect();
        let installed = vec![receipt("gawk", "5.3.0")];

        let err = Resolver::new(&store, ResolveOptions::default())
            .resolve(&specs(&["mawk"]), &installed)
            .unwrap_err();
        assert_eq!(err, conflict("mawk", "gawk", true));
        assert_eq!(err.to_string(), "'mawk' conflicts with 'gawk' (installed)");
    }

    #[test]
    fn test_installed_package_declaring_conflict() {
        let store: MemoryFormulaStore = [
            formula("mawk", "1.3.4", &[]),
            conflicting("gawk", "5.3.0", &[], &["mawk"]),
        ]
        .into_iter()
        .collect();
        let installed = vec![receipt("gawk", "5.3.0")];

        let err = Resolver::new(&store, ResolveOptions::default())
            .resolve(&specs(&["mawk"]), &installed)
            .unwrap_err();
        assert_eq!(err, conflict("mawk", "gawk", true));
    }

    #[test]
    fn test_unrelated_conflicts_ignored() {
        let store: MemoryFormulaStore = [
            conflicting("mawk", "1.3.4", &[], &["gawk"]),
            formula("jq", "1.7.1", &[]),
        ]
        .into_iter()
        .collect();
        let installed = vec![receipt("jq", "1.7.1")];

        let plan = Resolver::new(&store, ResolveOptions::default())
            .resolve(&specs(&["mawk"]), &installed)
            .unwrap();
        assert_eq!(plan.names(), vec!["mawk"]);
    }
}

#[test]
fn test_cancelled_before_start() {
    let store = wget_store(&MockDownloader::new());
    let cancel = CancellationToken::new();
    cancel.cancel();

    assert_eq!(
        Resolver::new(&store, ResolveOptions::default())
            .resolve_with_cancel(&specs(&["wget"]), &[], &cancel)
            .unwrap_err(),
        ResolveError::Cancelled
    );
}
