
use kegbrew::{
    Config, DependencyKind, FormulaStore, InstallError, KegError, MemoryFormulaStore, NoProgress,
    OutdatedPackage, PackageManager, PackageSpec, Version,
};
use std::sync::Arc;
use test_helpers::{MockDownloader, PLATFORM, TestEnvironment, simple, wget_store};

fn manager(
    env: &TestEnvironment,
    store: MemoryFormulaStore,
    downloader: &MockDownloader,
) -> PackageManager<MockDownloader> {
    let config = Config {
        prefix: env.prefix.clone(),
        cache_dir: env.cache_dir.clone(),
        jobs: 2,
        platform: PLATFORM.to_string(),
        ..Default::default()
    };
    let store: Arc<dyn FormulaStore> = Arc::new(store);
    PackageManager::with_parts(config, store, env.cache(), downloader.clone()).unwrap()
}

fn specs(requests: &[&str]) -> Vec<PackageSpec> {
    requests.iter().map(|s| s.parse().unwrap()).collect()
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

mod uninstall {
    use super::*;

    #[tokio::test]
    async fn test_batch_removes_dependents_first() {
        let env = TestEnvironment::new();
        let downloader = MockDownloader::new();
        let pm = manager(&env, wget_store(&downloader), &downloader);
        pm.install(&specs(&["wget"]), &NoProgress).await.unwrap();

        let removed = pm.uninstall(&names(&["openssl@3", "wget"]), false).unwrap();
        let removed: Vec<&str> = removed.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(removed, vec!["wget", "openssl@3"]);
        assert!(pm.list().unwrap().is_empty());
        assert!(!env.keg("openssl@3", "3.3.1").exists());
    }

    #[tokio::test]
    async fn test_dependent_outside_batch_still_refuses() {
        let env = TestEnvironment::new();
        let downloader = MockDownloader::new();
        let pm = manager(&env, wget_store(&downloader), &downloader);
        pm.install(&specs(&["wget"]), &NoProgress).await.unwrap();

        match pm.uninstall(&names(&["openssl@3"]), false) {
            Err(KegError::Install(InstallError::RequiredBy { dependents, .. })) => {
                assert_eq!(dependents, vec!["wget"]);
            }
            other => panic!("expected RequiredBy, got {:?}", other.map(|r| r.len())),
        }
        assert_eq!(pm.list().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_removal_order_keeps_unrelated_names_in_argument_order() {
        let env = TestEnvironment::new();
        let downloader = MockDownloader::new();
        let pm = manager(&env, wget_store(&downloader), &downloader);
        pm.install(&specs(&["wget"]), &NoProgress).await.unwrap();

        assert_eq!(
            pm.removal_order(&names(&["openssl@3", "jq", "wget", "jq"])).unwrap(),
            names(&["jq", "wget", "openssl@3"])
        );
    }
}

mod upgrade {
    use super::*;

    fn jq_store(downloader: &MockDownloader) -> MemoryFormulaStore {
        [
            simple(downloader, "jq", "1.6", &[]),
            simple(downloader, "jq", "1.7.1", &[]),
        ]
        .into_iter()
        .collect()
    }

    #[tokio::test]
    async fn test_outdated_lists_newer_formula() {
        let env = TestEnvironment::new();
        let downloader = MockDownloader::new();
        let pm = manager(&env, jq_store(&downloader), &downloader);
        pm.install(&specs(&["jq:1.6"]), &NoProgress).await.unwrap();

        assert_eq!(
            pm.outdated(&[]).unwrap(),
            vec![OutdatedPackage {
                name: "jq".to_string(),
                installed: Version::parse("1.6").unwrap(),
                latest: Version::parse("1.7.1").unwrap(),
            }]
        );
        assert!(matches!(
            pm.outdated(&names(&["wget"])),
            Err(KegError::Install(InstallError::NotInstalled(ref name))) if name == "wget"
        ));
    }

    #[tokio::test]
    async fn test_upgrade_installs_newest_version() {
        let env = TestEnvironment::new();
        let downloader = MockDownloader::new();
        let pm = manager(&env, jq_store(&downloader), &downloader);
        pm.install(&specs(&["jq:1.6"]), &NoProgress).await.unwrap();

        let result = pm.upgrade(&[], &NoProgress).await.unwrap();
        assert_eq!(result.report.upgraded, vec!["jq"]);

        let receipts = pm.list().unwrap();
        assert_eq!(receipts[0].version.as_str(), "1.7.1");
        assert!(receipts[0].installed_on_request);
        assert!(env.keg("jq", "1.7.1").join("bin/jq").exists());
        assert!(pm.outdated(&[]).unwrap().is_empty());

        // Nothing left to do
        let result = pm.upgrade(&[], &NoProgress).await.unwrap();
        assert!(result.plan.is_empty());
        assert_eq!(result.report.actions(), 0);
    }

    #[tokio::test]
    async fn test_upgraded_dependency_stays_a_dependency() {
        let env = TestEnvironment::new();
        let downloader = MockDownloader::new();
        let app = simple(&downloader, "app", "1.0", &[("lib", DependencyKind::Runtime)]);
        let lib_old = simple(&downloader, "lib", "1.0", &[]);
        let lib_new = simple(&downloader, "lib", "2.0", &[]);

        let before = manager(
            &env,
            [app.clone(), lib_old.clone()].into_iter().collect(),
            &downloader,
        );
        before.install(&specs(&["app"]), &NoProgress).await.unwrap();

        // A newer lib shows up in the formula directory
        let pm = manager(&env, [app, lib_old, lib_new].into_iter().collect(), &downloader);
        let outdated = pm.outdated(&[]).unwrap();
        assert_eq!(outdated.len(), 1);
        assert_eq!(outdated[0].name, "lib");

        let result = pm.upgrade(&[], &NoProgress).await.unwrap();
        assert_eq!(result.report.upgraded, vec!["lib"]);

        let receipts = pm.list().unwrap();
        let lib = receipts.iter().find(|r| r.name == "lib").unwrap();
        assert_eq!(lib.version.as_str(), "2.0");
        assert!(!lib.installed_on_request);
        let app = receipts.iter().find(|r| r.name == "app").unwrap();
        assert!(app.installed_on_request);
    }
}
