//! Repository integration tests against a real Postgres.
//!
//! Enabled with `--features pg-tests`. Uses `CANOPY_TEST_PG_HOST` /
//! `CANOPY_TEST_PG_PORT` when set, otherwise starts a disposable Postgres
//! container; skipped when Docker is unavailable.
use super::*;
use canopy_common::LdapError;
use canopy_schema::{Dn, SchemaConfig, SchemaRegistry};
use serial_test::serial;
use std::sync::Arc;
use testcontainers::clients::Cli;
use testcontainers::core::Container;
use testcontainers_modules::postgres::Postgres as PostgresImage;

struct PgContainer {
    host: String,
    port: u16,
    _container: Option<Container<'static, PostgresImage>>,
}

static PG_CONTAINER: tokio::sync::OnceCell<Option<PgContainer>> =
    tokio::sync::OnceCell::const_new();

fn docker_available() -> bool {
    std::process::Command::new("docker")
        .arg("version")
        .output()
        .is_ok()
}

async fn pg_endpoint() -> Option<(String, u16)> {
    let container = PG_CONTAINER
        .get_or_init(|| async {
            if let Ok(host) = std::env::var("CANOPY_TEST_PG_HOST") {
                let port = std::env::var("CANOPY_TEST_PG_PORT")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(5432);
                return Some(PgContainer {
                    host,
                    port,
                    _container: None,
                });
            }
            if !docker_available() {
                eprintln!("skipping pg-tests: docker not available");
                return None;
            }
            let docker = Box::leak(Box::new(Cli::default()));
            let container = docker.run(PostgresImage::default());
            let port = container.get_host_port_ipv4(5432);
            Some(PgContainer {
                host: "127.0.0.1".to_string(),
                port,
                _container: Some(container),
            })
        })
        .await
        .as_ref()?;
    Some((container.host.clone(), container.port))
}

fn schema() -> Arc<SchemaRegistry> {
    Arc::new(
        SchemaRegistry::new(SchemaConfig {
            suffix: "dc=example,dc=com".to_string(),
            root_dn: "cn=Manager,dc=example,dc=com".to_string(),
            ..SchemaConfig::default()
        })
        .expect("schema registry"),
    )
}

async fn fresh_repo() -> Option<Arc<Repository>> {
    let (host, port) = pg_endpoint().await?;
    let config = crate::config::RepositoryConfig {
        db_host: host,
        db_port: port,
        db_user: "postgres".to_string(),
        db_password: "postgres".to_string(),
        db_schema: "public".to_string(),
        db_name: "postgres".to_string(),
        db_max_open_conns: 5,
        db_max_idle_conns: 1,
        server_id: "test-node".to_string(),
        log_level: "info".to_string(),
        max_retry: 3,
    };
    // Each test starts from an empty tree.
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect_with(
            sqlx::postgres::PgConnectOptions::new()
                .host(&config.db_host)
                .port(config.db_port)
                .username(&config.db_user)
                .password(&config.db_password)
                .database(&config.db_name),
        )
        .await
        .expect("connect");
    sqlx::query("DROP TABLE IF EXISTS entry CASCADE")
        .execute(&pool)
        .await
        .expect("drop entry table");
    Some(
        Repository::with_pool(pool, config, schema())
            .await
            .expect("repository"),
    )
}

fn dn(repo: &Repository, value: &str) -> Dn {
    repo.schema().normalize_dn(value).expect("dn")
}

fn changelog(repo: &Repository, dn_str: &str, attrs: &[(&str, &[&str])]) -> Changelog {
    let target = dn(repo, dn_str);
    let requester = dn(repo, "cn=Manager,dc=example,dc=com");
    let mut changelog =
        Changelog::new(repo.schema().clone(), target, &AttrsOrig::new(), requester)
            .expect("changelog");
    for (name, values) in attrs {
        let sv = repo
            .schema()
            .new_value(name, values.iter().map(|v| v.to_string()).collect())
            .expect("value");
        changelog.add(sv).expect("add");
    }
    changelog.validate().expect("validate");
    changelog
}

async fn seed_tree(repo: &Arc<Repository>) -> (i64, i64) {
    let root = repo
        .insert(&changelog(
            repo,
            "dc=example,dc=com",
            &[("objectClass", &["domain", "dcObject"])],
        ))
        .await
        .expect("insert root");
    let users = repo
        .insert(&changelog(
            repo,
            "ou=Users,dc=example,dc=com",
            &[("objectClass", &["organizationalUnit"]), ("ou", &["Users"])],
        ))
        .await
        .expect("insert users");
    (root, users)
}

#[tokio::test]
#[serial]
async fn insert_root_and_promote_parent() {
    let Some(repo) = fresh_repo().await else {
        return;
    };

    // S1: the naming-context root starts as a leaf.
    let (root, users) = seed_tree(&repo).await;
    let cached_root = repo.cache().get(root).await.expect("cached root");
    assert_eq!(cached_root.parent_id, 0);

    // S2: the first child promoted it to a container with the full path.
    assert!(cached_root.is_container);
    assert_eq!(cached_root.path, vec![root]);
    assert!(cached_root.rev > 1);

    let cached_users = repo.cache().get(users).await.expect("cached users");
    assert_eq!(cached_users.rev, 1);
    assert_eq!(cached_users.parent_id, root);
    assert!(!cached_users.is_container);

    // Same name under the same parent is a conflict.
    let err = repo
        .insert(&changelog(
            &repo,
            "ou=Users,dc=example,dc=com",
            &[("objectClass", &["organizationalUnit"]), ("ou", &["Users"])],
        ))
        .await
        .expect_err("duplicate");
    assert!(matches!(err, LdapError::AlreadyExists));
}

#[tokio::test]
#[serial]
async fn insert_resolves_member_dns_and_backfills_member_of() {
    let Some(repo) = fresh_repo().await else {
        return;
    };
    let (_, _) = seed_tree(&repo).await;

    let bob = repo
        .insert(&changelog(
            &repo,
            "cn=bob,ou=Users,dc=example,dc=com",
            &[("objectClass", &["inetOrgPerson"]), ("sn", &["Jones"])],
        ))
        .await
        .expect("insert bob");

    // S3: the member DN is stored as bob's id, and bob gains memberOf.
    let admins = repo
        .insert(&changelog(
            &repo,
            "cn=admins,ou=Users,dc=example,dc=com",
            &[
                ("objectClass", &["groupOfNames"]),
                ("member", &["cn=bob,ou=Users,dc=example,dc=com"]),
            ],
        ))
        .await
        .expect("insert admins");

    let cached_admins = repo.cache().get(admins).await.expect("cached admins");
    assert_eq!(cached_admins.attrs_orig["member"], vec![bob.to_string()]);
    assert_eq!(cached_admins.norm_ints("member"), vec![bob]);

    let cached_bob = repo.cache().get(bob).await.expect("cached bob");
    assert_eq!(cached_bob.norm_ints("memberOf"), vec![admins]);

    // An unresolvable member DN names the offending value.
    let err = repo
        .insert(&changelog(
            &repo,
            "cn=ghosts,ou=Users,dc=example,dc=com",
            &[
                ("objectClass", &["groupOfNames"]),
                ("member", &["cn=ghost,ou=Users,dc=example,dc=com"]),
            ],
        ))
        .await
        .expect_err("unresolvable member");
    assert!(matches!(
        err,
        LdapError::InvalidPerSyntax { index: 0, .. }
    ));
}

#[tokio::test]
#[serial]
async fn update_applies_minimal_diff_and_bumps_rev() {
    let Some(repo) = fresh_repo().await else {
        return;
    };
    seed_tree(&repo).await;

    let alice = repo
        .insert(&changelog(
            &repo,
            "cn=alice,ou=Users,dc=example,dc=com",
            &[("objectClass", &["inetOrgPerson"]), ("sn", &["Doe"])],
        ))
        .await
        .expect("insert alice");
    let before = repo.cache().get(alice).await.expect("cached alice");

    // S4: replace sn; one update, rev + 1, modifyTimestamp stamped.
    let target = dn(&repo, "cn=alice,ou=Users,dc=example,dc=com");
    let schema = repo.schema().clone();
    repo.update(&target, |attrs_orig| {
        let requester = schema.normalize_dn("cn=Manager,dc=example,dc=com")?;
        let mut changelog =
            Changelog::new(schema.clone(), target.clone(), attrs_orig, requester)?;
        changelog.replace(schema.new_value("sn", vec!["Roe".to_string()])?)?;
        changelog.validate()?;
        Ok(changelog)
    })
    .await
    .expect("update");

    let after = repo.cache().get(alice).await.expect("cached alice");
    assert_eq!(after.rev, before.rev + 1);
    assert_eq!(after.attrs_orig["sn"], vec!["Roe"]);
    assert_eq!(after.attrs_orig["modifiersName"], vec!["cn=Manager"]);
    assert!(after.attrs_orig.contains_key("modifyTimestamp"));
}

#[tokio::test]
#[serial]
async fn update_dn_moves_between_parents() {
    let Some(repo) = fresh_repo().await else {
        return;
    };
    let (root, users) = seed_tree(&repo).await;

    let alice = repo
        .insert(&changelog(
            &repo,
            "cn=alice,ou=Users,dc=example,dc=com",
            &[("objectClass", &["inetOrgPerson"]), ("sn", &["Doe"])],
        ))
        .await
        .expect("insert alice");
    let people = repo
        .insert(&changelog(
            &repo,
            "ou=People,dc=example,dc=com",
            &[("objectClass", &["organizationalUnit"]), ("ou", &["People"])],
        ))
        .await
        .expect("insert people");

    // S5: rename and move in one operation.
    let old_dn = dn(&repo, "cn=alice,ou=Users,dc=example,dc=com");
    let new_dn = dn(&repo, "cn=alice2,ou=People,dc=example,dc=com");
    let schema = repo.schema().clone();
    let old_for_cb = old_dn.clone();
    repo.update_dn(&old_dn, &new_dn, None, |attrs_orig| {
        let requester = schema.normalize_dn("cn=Manager,dc=example,dc=com")?;
        Changelog::new(schema.clone(), old_for_cb.clone(), attrs_orig, requester)
    })
    .await
    .expect("update_dn");

    let cached_alice = repo.cache().get(alice).await.expect("cached alice");
    assert_eq!(cached_alice.parent_id, people);
    assert_eq!(cached_alice.rdn_norm, "cn=alice2");

    // New parent promoted, old parent demoted.
    let cached_people = repo.cache().get(people).await.expect("cached people");
    assert!(cached_people.is_container);
    assert_eq!(cached_people.path, vec![root, people]);
    let cached_users = repo.cache().get(users).await.expect("cached users");
    assert!(!cached_users.is_container);

    let mut dn_cache = canopy_schema::DnCache::new();
    assert_eq!(
        repo.cache()
            .find_entry_id(&new_dn, &mut dn_cache)
            .await
            .expect("resolves"),
        alice
    );
    assert!(matches!(
        repo.cache().find_entry_id(&old_dn, &mut dn_cache).await,
        Err(LdapError::NoSuchObject)
    ));
}

#[tokio::test]
#[serial]
async fn update_dn_rewrites_descendant_container_paths() {
    let Some(repo) = fresh_repo().await else {
        return;
    };
    let (root, users) = seed_tree(&repo).await;

    // groups > teams > dev: two nested containers under the root.
    let groups = repo
        .insert(&changelog(
            &repo,
            "ou=Groups,dc=example,dc=com",
            &[("objectClass", &["organizationalUnit"]), ("ou", &["Groups"])],
        ))
        .await
        .expect("insert groups");
    let teams = repo
        .insert(&changelog(
            &repo,
            "ou=Teams,ou=Groups,dc=example,dc=com",
            &[("objectClass", &["organizationalUnit"]), ("ou", &["Teams"])],
        ))
        .await
        .expect("insert teams");
    let dev = repo
        .insert(&changelog(
            &repo,
            "cn=dev,ou=Teams,ou=Groups,dc=example,dc=com",
            &[("objectClass", &["device"])],
        ))
        .await
        .expect("insert dev");

    // Move the whole groups subtree under ou=Users, keeping the RDN.
    let old_dn = dn(&repo, "ou=Groups,dc=example,dc=com");
    let new_dn = dn(&repo, "ou=Groups,ou=Users,dc=example,dc=com");
    let schema = repo.schema().clone();
    let old_for_cb = old_dn.clone();
    repo.update_dn(&old_dn, &new_dn, None, |attrs_orig| {
        let requester = schema.normalize_dn("cn=Manager,dc=example,dc=com")?;
        Changelog::new(schema.clone(), old_for_cb.clone(), attrs_orig, requester)
    })
    .await
    .expect("move subtree");

    // S13: every descendant container carries the rewritten chain.
    let cached_groups = repo.cache().get(groups).await.expect("cached groups");
    assert_eq!(cached_groups.parent_id, users);
    assert_eq!(cached_groups.path, vec![root, users, groups]);
    let cached_teams = repo.cache().get(teams).await.expect("cached teams");
    assert_eq!(cached_teams.path, vec![root, users, groups, teams]);

    // The leaf below the moved subtree resolves at its new DN.
    let mut dn_cache = canopy_schema::DnCache::new();
    let dev_dn = dn(&repo, "cn=dev,ou=Teams,ou=Groups,ou=Users,dc=example,dc=com");
    assert_eq!(
        repo.cache()
            .find_entry_id(&dev_dn, &mut dn_cache)
            .await
            .expect("resolves"),
        dev
    );

    // Scope sub from the new location sees the whole subtree.
    let base = dn(&repo, "ou=Groups,ou=Users,dc=example,dc=com");
    let (total, _) = repo
        .search(
            &base,
            &SearchOption {
                scope: SearchScope::Sub,
                filter: Filter::Present("objectClass".to_string()),
                page_size: 10,
                offset: 0,
                requested_association: Vec::new(),
                member_of_requested: false,
                has_subordinates_requested: false,
            },
            |_| Ok(()),
        )
        .await
        .expect("search");
    assert_eq!(total, 3);
}

#[tokio::test]
#[serial]
async fn delete_scrubs_membership_and_demotes_parent() {
    let Some(repo) = fresh_repo().await else {
        return;
    };
    let (_, users) = seed_tree(&repo).await;

    let bob = repo
        .insert(&changelog(
            &repo,
            "cn=bob,ou=Users,dc=example,dc=com",
            &[("objectClass", &["inetOrgPerson"]), ("sn", &["Jones"])],
        ))
        .await
        .expect("insert bob");
    let admins = repo
        .insert(&changelog(
            &repo,
            "cn=admins,ou=Users,dc=example,dc=com",
            &[
                ("objectClass", &["groupOfNames"]),
                ("member", &["cn=bob,ou=Users,dc=example,dc=com"]),
            ],
        ))
        .await
        .expect("insert admins");

    // Deleting the populated parent is refused.
    let err = repo
        .delete_by_dn(&dn(&repo, "ou=Users,dc=example,dc=com"))
        .await
        .expect_err("non-leaf");
    assert!(matches!(err, LdapError::NotAllowedOnNonLeaf));

    // S6: deleting bob removes him from the group's member list.
    repo.delete_by_dn(&dn(&repo, "cn=bob,ou=Users,dc=example,dc=com"))
        .await
        .expect("delete bob");
    assert!(repo.cache().get(bob).await.is_none());
    let cached_admins = repo.cache().get(admins).await.expect("cached admins");
    assert!(cached_admins.norm_ints("member").is_empty());

    // S12: removing the last child demotes the parent.
    repo.delete_by_dn(&dn(&repo, "cn=admins,ou=Users,dc=example,dc=com"))
        .await
        .expect("delete admins");
    let cached_users = repo.cache().get(users).await.expect("cached users");
    assert!(!cached_users.is_container);
    assert!(cached_users.path.is_empty());

    // Deleting again is NoSuchObject.
    let err = repo
        .delete_by_dn(&dn(&repo, "cn=admins,ou=Users,dc=example,dc=com"))
        .await
        .expect_err("already gone");
    assert!(matches!(err, LdapError::NoSuchObject));
}

#[tokio::test]
#[serial]
async fn search_pages_through_subtree() {
    let Some(repo) = fresh_repo().await else {
        return;
    };
    seed_tree(&repo).await;
    for name in ["alice", "bob", "carol"] {
        repo.insert(&changelog(
            &repo,
            &format!("cn={name},ou=Users,dc=example,dc=com"),
            &[("objectClass", &["inetOrgPerson"]), ("sn", &["X"])],
        ))
        .await
        .expect("insert person");
    }

    // S7: base=suffix, scope=sub, filter on objectClass, page size 2.
    let base = dn(&repo, "dc=example,dc=com");
    let option = |offset| SearchOption {
        scope: SearchScope::Sub,
        filter: Filter::Equality {
            attr: "objectClass".to_string(),
            value: "inetOrgPerson".to_string(),
        },
        page_size: 2,
        offset,
        requested_association: Vec::new(),
        member_of_requested: false,
        has_subordinates_requested: true,
    };

    let mut first_page = Vec::new();
    let (total, returned) = repo
        .search(&base, &option(0), |entry| {
            first_page.push(entry.dn_orig().to_string());
            Ok(())
        })
        .await
        .expect("search");
    assert_eq!(total, 3);
    assert_eq!(returned, 2);
    assert_eq!(first_page.len(), 2);

    let mut second_page = Vec::new();
    let (total, returned) = repo
        .search(&base, &option(2), |entry| {
            second_page.push(entry.dn_orig().to_string());
            Ok(())
        })
        .await
        .expect("search");
    assert_eq!(total, 3);
    assert_eq!(returned, 1);
    assert!(!second_page.iter().any(|dn| first_page.contains(dn)));

    // hasSubordinates materializes from the container flag.
    let mut flags = Vec::new();
    repo.search(
        &base,
        &SearchOption {
            scope: SearchScope::Base,
            filter: Filter::Present("objectClass".to_string()),
            page_size: 10,
            offset: 0,
            requested_association: Vec::new(),
            member_of_requested: false,
            has_subordinates_requested: true,
        },
        |entry| {
            flags.push(entry.attrs_orig()["hasSubordinates"].clone());
            Ok(())
        },
    )
    .await
    .expect("base search");
    assert_eq!(flags, vec![vec!["TRUE".to_string()]]);
}

#[tokio::test]
#[serial]
async fn search_renders_member_of_as_dns() {
    let Some(repo) = fresh_repo().await else {
        return;
    };
    seed_tree(&repo).await;

    repo.insert(&changelog(
        &repo,
        "cn=bob,ou=Users,dc=example,dc=com",
        &[("objectClass", &["inetOrgPerson"]), ("sn", &["Jones"])],
    ))
    .await
    .expect("insert bob");
    repo.insert(&changelog(
        &repo,
        "cn=admins,ou=Users,dc=example,dc=com",
        &[
            ("objectClass", &["groupOfNames"]),
            ("member", &["cn=bob,ou=Users,dc=example,dc=com"]),
        ],
    ))
    .await
    .expect("insert admins");

    let base = dn(&repo, "cn=bob,ou=Users,dc=example,dc=com");
    let mut member_of = Vec::new();
    repo.search(
        &base,
        &SearchOption {
            scope: SearchScope::Base,
            filter: Filter::Present("objectClass".to_string()),
            page_size: 10,
            offset: 0,
            requested_association: Vec::new(),
            member_of_requested: true,
            has_subordinates_requested: false,
        },
        |entry| {
            member_of = entry.attrs_orig()["memberOf"].clone();
            Ok(())
        },
    )
    .await
    .expect("search");
    assert_eq!(member_of, vec!["cn=admins,ou=Users,dc=example,dc=com"]);
}

#[tokio::test]
#[serial]
async fn bind_fetches_credentials_from_the_cache() {
    let Some(repo) = fresh_repo().await else {
        return;
    };
    seed_tree(&repo).await;

    repo.insert(&changelog(
        &repo,
        "cn=alice,ou=Users,dc=example,dc=com",
        &[
            ("objectClass", &["inetOrgPerson"]),
            ("sn", &["Doe"]),
            ("userPassword", &["{SSHA}secret"]),
        ],
    ))
    .await
    .expect("insert alice");

    let target = dn(&repo, "cn=alice,ou=Users,dc=example,dc=com");
    repo.bind(&target, |fetched| {
        assert_eq!(fetched.credential, vec!["{SSHA}secret"]);
        assert_eq!(fetched.pwd_failure_count, 0);
        assert!(!fetched.ppolicy.is_lockout_enabled());
        Ok(())
    })
    .await
    .expect("bind");

    // Wrong credentials surface as InvalidCredentials from the callback.
    let err = repo
        .bind(&target, |_| Err(LdapError::InvalidCredentials))
        .await
        .expect_err("wrong password");
    assert!(matches!(err, LdapError::InvalidCredentials));

    // An unknown DN is indistinguishable from a bad password.
    let err = repo
        .bind(&dn(&repo, "cn=ghost,ou=Users,dc=example,dc=com"), |_| Ok(()))
        .await
        .expect_err("unknown dn");
    assert!(matches!(err, LdapError::InvalidCredentials));
}
