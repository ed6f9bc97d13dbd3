//! Subscription discovery across the repository cache.
//!
//! Scans every cached checkout for a manifest whose subscriptions name the
//! producing artifact and event type. Invalid manifests are skipped with a
//! warning rather than failing the scan.

use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use tako_core::manifest::{Manifest, Subscription};
use tako_core::reference::ArtifactRef;

/// One subscription that matched a produced event.
#[derive(Debug, Clone)]
pub struct SubscriberMatch {
    /// Checkout directory of the subscribing repository.
    pub repo_path: PathBuf,
    pub repo_name: String,
    /// Position within the subscriber's `subscriptions` list.
    pub subscription_index: usize,
    pub subscription: Subscription,
}

/// Find every subscription listening for `(artifact, event_type)`.
///
/// Results are ordered by (subscriber repo name, subscription index) so
/// diamond resolution downstream is deterministic.
pub fn find_subscribers(
    cache_root: &Path,
    artifact: &ArtifactRef,
    event_type: &str,
) -> Vec<SubscriberMatch> {
    let mut matches = Vec::new();
    let repos = cache_root.join("repos");

    for checkout in cached_checkouts(&repos) {
        let manifest = match Manifest::load_from_dir(&checkout) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(repo = %checkout.display(), error = %e, "skipping invalid manifest during discovery");
                continue;
            }
        };
        let repo_name = manifest.name().to_string();
        for (index, subscription) in manifest.subscriptions.iter().enumerate() {
            let Ok(subscribed) = ArtifactRef::parse(&subscription.artifact) else {
                continue;
            };
            if &subscribed == artifact && subscription.events.iter().any(|e| e == event_type) {
                debug!(
                    repo = %repo_name,
                    index,
                    event = event_type,
                    "subscription matched"
                );
                matches.push(SubscriberMatch {
                    repo_path: checkout.clone(),
                    repo_name: repo_name.clone(),
                    subscription_index: index,
                    subscription: subscription.clone(),
                });
            }
        }
    }

    matches.sort_by(|a, b| {
        (a.repo_name.as_str(), a.subscription_index)
            .cmp(&(b.repo_name.as_str(), b.subscription_index))
    });
    matches
}

/// Enumerate `<repos>/<owner>/<name>/<branch>` directories that contain a
/// manifest.
fn cached_checkouts(repos: &Path) -> Vec<PathBuf> {
    let mut checkouts = Vec::new();
    for owner in read_dirs(repos) {
        for name in read_dirs(&owner) {
            for branch in read_dirs(&name) {
                if Manifest::find(&branch).is_ok() {
                    checkouts.push(branch);
                }
            }
        }
    }
    checkouts.sort();
    checkouts
}

fn read_dirs(path: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(path) else {
        return Vec::new();
    };
    entries
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_subscriber(cache: &Path, owner: &str, name: &str, yaml: &str) {
        let dir = cache.join("repos").join(owner).join(name).join("main");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("tako.yml"), yaml).unwrap();
    }

    fn artifact() -> ArtifactRef {
        ArtifactRef::parse("acme/widgets:lib").unwrap()
    }

    #[test]
    fn finds_matching_subscriptions_in_order() {
        let cache = tempfile::tempdir().unwrap();
        write_subscriber(
            cache.path(),
            "acme",
            "consumer-b",
            r#"
version: "1.0.0"
metadata:
  name: consumer-b
workflows:
  deploy:
    steps:
      - echo ok
subscriptions:
  - artifact: acme/widgets:lib
    events: [library_built]
    workflow: deploy
"#,
        );
        write_subscriber(
            cache.path(),
            "acme",
            "consumer-a",
            r#"
version: "1.0.0"
metadata:
  name: consumer-a
workflows:
  alpha:
    steps:
      - echo a
  beta:
    steps:
      - echo b
subscriptions:
  - artifact: acme/widgets:lib
    events: [library_built]
    workflow: alpha
  - artifact: acme/widgets:lib
    events: [library_built]
    workflow: beta
"#,
        );

        let matches = find_subscribers(cache.path(), &artifact(), "library_built");
        let summary: Vec<(&str, usize, &str)> = matches
            .iter()
            .map(|m| {
                (
                    m.repo_name.as_str(),
                    m.subscription_index,
                    m.subscription.workflow.as_str(),
                )
            })
            .collect();
        assert_eq!(
            summary,
            [
                ("consumer-a", 0, "alpha"),
                ("consumer-a", 1, "beta"),
                ("consumer-b", 0, "deploy"),
            ]
        );
    }

    #[test]
    fn unrelated_artifact_or_event_does_not_match() {
        let cache = tempfile::tempdir().unwrap();
        write_subscriber(
            cache.path(),
            "acme",
            "consumer",
            r#"
version: "1.0.0"
metadata:
  name: consumer
workflows:
  deploy:
    steps:
      - echo ok
subscriptions:
  - artifact: acme/widgets:other
    events: [library_built]
    workflow: deploy
  - artifact: acme/widgets:lib
    events: [release_cut]
    workflow: deploy
"#,
        );

        assert!(find_subscribers(cache.path(), &artifact(), "library_built").is_empty());
    }

    #[test]
    fn invalid_manifests_are_skipped() {
        let cache = tempfile::tempdir().unwrap();
        write_subscriber(cache.path(), "acme", "broken", "version: [not, a, string]\n");
        write_subscriber(
            cache.path(),
            "acme",
            "consumer",
            r#"
version: "1.0.0"
metadata:
  name: consumer
workflows:
  deploy:
    steps:
      - echo ok
subscriptions:
  - artifact: acme/widgets:lib
    events: [library_built]
    workflow: deploy
"#,
        );

        let matches = find_subscribers(cache.path(), &artifact(), "library_built");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].repo_name, "consumer");
    }

    #[test]
    fn empty_cache_yields_no_matches() {
        let cache = tempfile::tempdir().unwrap();
        assert!(find_subscribers(cache.path(), &artifact(), "library_built").is_empty());
    }
}
