use langrepo_core::db::open_db_in_memory;
use langrepo_core::{
    Criteria, DefaultLanguageRepository, Direction, EntityManager, EntityManagerOptions, Expr,
    Language, LanguageId, LanguageRepository, SqliteEntityManager, SqliteLanguageRepository,
    StoreError,
};
use rusqlite::{params, Connection};
use std::error::Error;

fn seed(repo: &SqliteLanguageRepository<'_>, languages: &[Language]) {
    for language in languages {
        repo.add(language).unwrap();
    }
}

fn european() -> Vec<Language> {
    vec![
        Language::new("en", "English").with_position(1),
        Language::new("fr", "French")
            .with_native_name("Français")
            .with_position(2),
        Language::new("de", "German")
            .with_native_name("Deutsch")
            .with_position(3),
    ]
}

fn ids(pairs: &[(usize, Language)]) -> Vec<(usize, &str)> {
    pairs
        .iter()
        .map(|(index, language)| (*index, language.id.as_str()))
        .collect()
}

fn row_count(conn: &Connection) -> i64 {
    conn.query_row("SELECT COUNT(*) FROM languages;", [], |row| row.get(0))
        .unwrap()
}

#[test]
fn get_missing_returns_none() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteLanguageRepository::from_connection(&conn);

    assert!(repo.get(&LanguageId::from("xx")).unwrap().is_none());
}

#[test]
fn add_then_get_roundtrip() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteLanguageRepository::from_connection(&conn);

    let language = Language::new("pt-BR", "Portuguese (Brazil)")
        .with_native_name("Português")
        .with_position(7);
    repo.add(&language).unwrap();

    assert_eq!(repo.get(&language.id).unwrap(), Some(language.clone()));

    // A second repository has an empty identity map and must read the row.
    let fresh = SqliteLanguageRepository::from_connection(&conn);
    assert_eq!(fresh.get(&language.id).unwrap(), Some(language));
}

#[test]
fn update_reflects_mutation() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteLanguageRepository::from_connection(&conn);

    let mut language = Language::new("de", "German");
    repo.add(&language).unwrap();

    language.native_name = Some("Deutsch".to_string());
    language.disable();
    repo.update(&language).unwrap();

    assert_eq!(repo.get(&language.id).unwrap(), Some(language.clone()));

    let fresh = SqliteLanguageRepository::from_connection(&conn);
    let stored = fresh.get(&language.id).unwrap().unwrap();
    assert_eq!(stored.native_name.as_deref(), Some("Deutsch"));
    assert!(!stored.enabled);

    let version: i64 = conn
        .query_row(
            "SELECT version FROM languages WHERE id = ?1;",
            params!["de"],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(version, 2);
}

#[test]
fn repeated_updates_advance_tracked_version() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteLanguageRepository::from_connection(&conn);

    let mut language = Language::new("it", "Italian");
    repo.add(&language).unwrap();
    for position in 1..=3 {
        language.position = position;
        repo.update(&language).unwrap();
    }

    let fresh = SqliteLanguageRepository::from_connection(&conn);
    assert_eq!(fresh.get(&language.id).unwrap().unwrap().position, 3);
}

#[test]
fn remove_then_get_returns_none() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteLanguageRepository::from_connection(&conn);

    let language = Language::new("fr", "French");
    repo.add(&language).unwrap();
    repo.remove(&language).unwrap();

    assert!(repo.get(&language.id).unwrap().is_none());
    assert_eq!(row_count(&conn), 0);
}

#[test]
fn match_prefix_yields_only_matching_language() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteLanguageRepository::from_connection(&conn);
    seed(&repo, &european());

    let matched = repo
        .match_criteria(&Criteria::new().filter_by(Expr::starts_with("id", "e")))
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();

    assert_eq!(ids(&matched), vec![(0, "en")]);
}

#[test]
fn match_yields_store_order_with_positional_index() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteLanguageRepository::from_connection(&conn);
    seed(&repo, &european());

    let matched = repo
        .match_criteria(&Criteria::new().order_by("position", Direction::Desc))
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();

    assert_eq!(ids(&matched), vec![(0, "de"), (1, "fr"), (2, "en")]);
}

#[test]
fn match_combines_filters() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteLanguageRepository::from_connection(&conn);
    let mut languages = european();
    languages[1].disable();
    seed(&repo, &languages);

    let criteria = Criteria::new()
        .and_where(Expr::eq("enabled", true))
        .and_where(Expr::is_null("native_name").negate())
        .or_where(Expr::eq("id", "en"));
    let matched = repo
        .match_criteria(&criteria)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();

    assert_eq!(ids(&matched), vec![(0, "de"), (1, "en")]);
}

#[test]
fn exhausted_match_clears_identity_map() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteLanguageRepository::from_connection(&conn);
    seed(&repo, &european());

    conn.execute(
        "UPDATE languages SET name = 'Anglais' WHERE id = 'en';",
        [],
    )
    .unwrap();

    // Tracked copy still wins before the match runs.
    let cached = repo.get(&LanguageId::from("en")).unwrap().unwrap();
    assert_eq!(cached.name, "English");

    let matched = repo
        .match_criteria(&Criteria::new())
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(matched.len(), 3);
    assert_eq!(repo.manager().tracked_count(), 0);

    let reread = repo.get(&LanguageId::from("en")).unwrap().unwrap();
    assert_eq!(reread.name, "Anglais");
}

#[test]
fn abandoned_match_clears_identity_map_on_drop() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteLanguageRepository::from_connection(&conn);
    seed(&repo, &european());
    assert_eq!(repo.manager().tracked_count(), 3);

    {
        let mut matches = repo.match_criteria(&Criteria::new()).unwrap();
        let first = matches.next().unwrap().unwrap();
        assert_eq!(first.0, 0);
        assert!(repo.manager().tracked_count() > 0);
    }

    assert_eq!(repo.manager().tracked_count(), 0);
}

#[test]
fn match_fetches_pages_lazily() {
    let conn = open_db_in_memory().unwrap();
    let manager = SqliteEntityManager::<Language>::with_options(
        &conn,
        EntityManagerOptions { batch_size: 2 },
    );
    let repo = DefaultLanguageRepository::new(manager);
    for code in ["aa", "bb", "cc", "dd", "ee"] {
        repo.add(&Language::new(code, code.to_uppercase())).unwrap();
    }
    repo.manager().clear();

    let mut matches = repo.match_criteria(&Criteria::new()).unwrap();
    assert_eq!(repo.manager().tracked_count(), 2);

    matches.next().unwrap().unwrap();
    matches.next().unwrap().unwrap();
    assert_eq!(repo.manager().tracked_count(), 2);

    let (index, third) = matches.next().unwrap().unwrap();
    assert_eq!((index, third.id.as_str()), (2, "cc"));
    assert_eq!(repo.manager().tracked_count(), 4);

    let rest = matches.collect::<Result<Vec<_>, _>>().unwrap();
    assert_eq!(ids(&rest), vec![(3, "dd"), (4, "ee")]);
    assert_eq!(repo.manager().tracked_count(), 0);
}

#[test]
fn match_honors_first_and_max_results() {
    let conn = open_db_in_memory().unwrap();
    let manager = SqliteEntityManager::<Language>::with_options(
        &conn,
        EntityManagerOptions { batch_size: 2 },
    );
    let repo = DefaultLanguageRepository::new(manager);
    for code in ["aa", "bb", "cc", "dd", "ee"] {
        repo.add(&Language::new(code, code.to_uppercase())).unwrap();
    }

    let criteria = Criteria::new().with_first_result(1).with_max_results(3);
    let matched = repo
        .match_criteria(&criteria)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();

    assert_eq!(ids(&matched), vec![(0, "bb"), (1, "cc"), (2, "dd")]);
}

#[test]
fn match_with_unknown_field_fails_with_query_cause() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteLanguageRepository::from_connection(&conn);

    let err = match repo.match_criteria(&Criteria::new().filter_by(Expr::eq("dialect", "x"))) {
        Ok(_) => panic!("unknown field should fail"),
        Err(err) => err,
    };
    assert!(matches!(err.cause(), StoreError::Query(_)));
    assert_eq!(err.code(), 0);
    assert!(err.message().contains("dialect"));
}

#[test]
fn entities_updated_during_match_are_committed() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteLanguageRepository::from_connection(&conn);
    seed(&repo, &european());
    repo.manager().clear();

    for item in repo.match_criteria(&Criteria::new()).unwrap() {
        let (_, mut language) = item.unwrap();
        language.position += 10;
        repo.update(&language).unwrap();
    }

    let positions: Vec<i64> = conn
        .prepare("SELECT position FROM languages ORDER BY id;")
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(positions, vec![13, 11, 12]);
}

fn paged_repository(conn: &Connection) -> SqliteLanguageRepository<'_> {
    let manager = SqliteEntityManager::<Language>::with_options(
        conn,
        EntityManagerOptions { batch_size: 2 },
    );
    let repo = DefaultLanguageRepository::new(manager);
    for code in ["aa", "bb", "cc", "dd", "ee"] {
        repo.add(&Language::new(code, code.to_uppercase())).unwrap();
    }
    repo.manager().clear();
    repo
}

#[test]
fn removing_each_yielded_language_visits_every_row() {
    let conn = open_db_in_memory().unwrap();
    let repo = paged_repository(&conn);

    let mut seen = Vec::new();
    for item in repo.match_criteria(&Criteria::new()).unwrap() {
        let (index, language) = item.unwrap();
        seen.push((index, language.id.as_str().to_string()));
        repo.remove(&language).unwrap();
    }

    let seen = seen
        .iter()
        .map(|(index, id)| (*index, id.as_str()))
        .collect::<Vec<_>>();
    assert_eq!(
        seen,
        vec![(0, "aa"), (1, "bb"), (2, "cc"), (3, "dd"), (4, "ee")]
    );
    assert_eq!(row_count(&conn), 0);
}

#[test]
fn updates_that_leave_the_filter_do_not_skip_rows() {
    let conn = open_db_in_memory().unwrap();
    let repo = paged_repository(&conn);

    let mut seen = 0;
    for item in repo
        .match_criteria(&Criteria::new().filter_by(Expr::eq("enabled", true)))
        .unwrap()
    {
        let (_, mut language) = item.unwrap();
        language.disable();
        repo.update(&language).unwrap();
        seen += 1;
    }

    assert_eq!(seen, 5);
    let still_enabled: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM languages WHERE enabled = 1;",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(still_enabled, 0);
}

#[test]
fn failed_match_leaves_identity_map_empty() {
    let conn = open_db_in_memory().unwrap();
    conn.execute_batch(
        "INSERT INTO languages (id, name) VALUES ('aa', 'Afar');
         INSERT INTO languages (id, name) VALUES ('zzzz', 'Broken');",
    )
    .unwrap();
    let repo = SqliteLanguageRepository::from_connection(&conn);

    let err = match repo.match_criteria(&Criteria::new()) {
        Ok(_) => panic!("corrupt row should fail the first page"),
        Err(err) => err,
    };

    assert!(matches!(err.cause(), StoreError::Mapping(_)));
    assert_eq!(repo.manager().tracked_count(), 0);
}

#[test]
fn invalid_language_is_rejected_before_storage() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteLanguageRepository::from_connection(&conn);

    let err = repo.add(&Language::new("English", "English")).unwrap_err();
    assert!(matches!(err.cause(), StoreError::Validation(_)));
    assert_eq!(row_count(&conn), 0);
    assert_eq!(repo.manager().pending_count(), 0);
}

#[test]
fn add_of_existing_key_overwrites_stored_row() {
    let conn = open_db_in_memory().unwrap();
    let first = SqliteLanguageRepository::from_connection(&conn);
    let second = SqliteLanguageRepository::from_connection(&conn);

    first.add(&Language::new("en", "English")).unwrap();
    second.add(&Language::new("en", "English (US)")).unwrap();

    assert_eq!(row_count(&conn), 1);
    let fresh = SqliteLanguageRepository::from_connection(&conn);
    assert_eq!(
        fresh.get(&LanguageId::from("en")).unwrap().unwrap().name,
        "English (US)"
    );
}

#[test]
fn store_constraint_failure_keeps_extended_code() {
    let conn = open_db_in_memory().unwrap();
    conn.execute_batch(
        "CREATE TRIGGER languages_frozen_names BEFORE UPDATE OF name ON languages
         BEGIN SELECT RAISE(ABORT, 'language names are frozen'); END;",
    )
    .unwrap();
    let repo = SqliteLanguageRepository::from_connection(&conn);
    let mut language = Language::new("en", "English");
    repo.add(&language).unwrap();

    language.name = "Anglais".to_string();
    let err = repo.update(&language).unwrap_err();

    assert!(matches!(
        err.cause(),
        StoreError::Sqlite(rusqlite::Error::SqliteFailure(failure, _))
            if failure.code == rusqlite::ErrorCode::ConstraintViolation
    ));
    assert_eq!(
        err.code(),
        i64::from(rusqlite::ffi::SQLITE_CONSTRAINT_TRIGGER)
    );
    assert!(err.message().contains("language names are frozen"));
    assert_eq!(repo.manager().pending_count(), 0);

    let fresh = SqliteLanguageRepository::from_connection(&conn);
    assert_eq!(
        fresh.get(&language.id).unwrap().unwrap().name,
        "English"
    );
}

#[test]
fn update_after_match_cleared_identity_map() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteLanguageRepository::from_connection(&conn);
    repo.add(&Language::new("en", "English")).unwrap();

    let matched = repo
        .match_criteria(&Criteria::new())
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(repo.manager().tracked_count(), 0);

    let (_, mut english) = matched.into_iter().next().unwrap();
    english.native_name = Some("English".to_string());
    repo.update(&english).unwrap();

    assert_eq!(repo.get(&english.id).unwrap(), Some(english));
    assert_eq!(row_count(&conn), 1);
}

#[test]
fn update_from_second_repository_without_prior_get() {
    let conn = open_db_in_memory().unwrap();
    SqliteLanguageRepository::from_connection(&conn)
        .add(&Language::new("fr", "French"))
        .unwrap();

    let other = SqliteLanguageRepository::from_connection(&conn);
    let french = Language::new("fr", "French").with_native_name("Français");
    other.update(&french).unwrap();

    let fresh = SqliteLanguageRepository::from_connection(&conn);
    assert_eq!(fresh.get(&french.id).unwrap(), Some(french));
}

#[test]
fn stale_update_raises_optimistic_lock() {
    let conn = open_db_in_memory().unwrap();
    let writer = SqliteLanguageRepository::from_connection(&conn);
    writer.add(&Language::new("es", "Spanish")).unwrap();

    let first = SqliteLanguageRepository::from_connection(&conn);
    let second = SqliteLanguageRepository::from_connection(&conn);
    let mut from_first = first.get(&LanguageId::from("es")).unwrap().unwrap();
    let mut from_second = second.get(&LanguageId::from("es")).unwrap().unwrap();

    from_first.native_name = Some("Español".to_string());
    first.update(&from_first).unwrap();

    from_second.position = 9;
    let err = second.update(&from_second).unwrap_err();

    match err.cause() {
        StoreError::OptimisticLock {
            entity,
            key,
            expected_version,
        } => {
            assert_eq!(*entity, "language");
            assert_eq!(key, "es");
            assert_eq!(*expected_version, 1);
        }
        other => panic!("unexpected cause: {other}"),
    }
    let source = err.source().expect("persistence errors keep their cause");
    assert!(source.downcast_ref::<StoreError>().is_some());

    let stored = SqliteLanguageRepository::from_connection(&conn)
        .get(&LanguageId::from("es"))
        .unwrap()
        .unwrap();
    assert_eq!(stored.native_name.as_deref(), Some("Español"));
    assert_eq!(stored.position, 0);
}

#[test]
fn removing_unknown_language_is_a_no_op() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteLanguageRepository::from_connection(&conn);

    repo.remove(&Language::new("zz", "Nowhere")).unwrap();
    assert_eq!(row_count(&conn), 0);
}
