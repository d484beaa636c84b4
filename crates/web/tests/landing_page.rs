//! End-to-end scenarios: the notes app served on a live-server thread and
//! driven by the document browser.

use std::sync::Arc;

use ghostrunner_common::{AppContext, Database, DatabaseSettings, Engine, SessionAuth, DEFAULT_ALIAS};
use ghostrunner_e2e::logging::init_test_logging;
use ghostrunner_e2e::{E2eError, FillStrategy, FormFillRequest, HarnessConfig, TestEnvironment};
use ghostrunner_web::{install_schema, NoteStore};

fn database(context: &AppContext) -> Database {
    context.connections.default_db().unwrap().clone()
}

fn environment() -> (AppContext, TestEnvironment) {
    init_test_logging();
    let context = AppContext::new(&[DatabaseSettings::new(DEFAULT_ALIAS, Engine::SqliteMemory)]);
    let db = database(&context);
    install_schema(&db).unwrap();
    SessionAuth::new(db.clone())
        .create_user("john", "john@example.com", "secret")
        .unwrap();

    let config = HarnessConfig::from_env().unwrap().with_address("localhost:8090-9000");
    let env = TestEnvironment::builder(context.clone(), Arc::new(ghostrunner_web::app))
        .config(config)
        .authenticator(Arc::new(SessionAuth::new(db)))
        .start()
        .unwrap();
    (context, env)
}

#[test]
fn landing_page() {
    let (context, mut env) = environment();
    let port = env.server().and_then(|s| s.port()).unwrap();
    assert!((8090..=9000).contains(&port));
    assert_eq!(env.live_server_url(), format!("http://localhost:{}", port));

    // Anonymous visitor sees the greeting.
    env.test(|env| {
        let (page, resources) = env.open("/").unwrap();
        assert_eq!(page.http_status, 200);
        assert_eq!(resources.len(), 1);
        assert_eq!(
            env.evaluate("document.querySelector('.title').innerHTML").unwrap(),
            "Hello, twisted world."
        );
        // The document browser never runs the error-collecting script.
        assert!(matches!(env.js_errors(), Err(E2eError::Script(_))));
    });

    // A bridged session is authenticated without going through the form.
    env.test(|env| {
        let session = env.set_session_cookie("john", "secret").unwrap();
        assert_eq!(env.browser().cookies().get("sessionid").unwrap().value, session.token);

        let (page, _) = env.open("/").unwrap();
        assert!(page.content.contains("Welcome, john"));
    });

    // Cookies from the previous test are gone.
    env.test(|env| {
        let (page, _) = env.open("/").unwrap();
        assert!(!page.content.contains("Welcome"));
    });

    env.test(|env| {
        let err = env.set_session_cookie("john", "wrong").unwrap_err();
        assert!(matches!(err, E2eError::Authentication(_)));
        assert!(env.browser().cookies().is_empty());
    });

    env.stop().unwrap();
    assert!(!database(&context).allows_thread_sharing());
}

#[test]
fn login_and_notes_forms() {
    let (context, mut env) = environment();
    let notes = NoteStore::new(database(&context));

    env.test(|env| {
        env.open("/login/").unwrap();
        let report = env
            .fill_form(
                &FormFillRequest::new("#login-form")
                    .field("username", "john")
                    .field("password", "secret")
                    .submit(true),
            )
            .unwrap();

        assert_eq!(report.strategy, FillStrategy::Bulk);
        assert_eq!(env.path().unwrap(), "/");
        assert_eq!(
            env.evaluate("document.querySelector('.welcome').textContent").unwrap(),
            "Welcome, john"
        );
    });

    // The body is a textarea, which only the per-field fallback reaches.
    env.test(|env| {
        env.open("/notes/").unwrap();
        let report = env
            .fill_form(
                &FormFillRequest::new("#note-form")
                    .field("title", "Groceries")
                    .field("body", "eggs & milk")
                    .submit(true),
            )
            .unwrap();

        assert_eq!(report.strategy, FillStrategy::Fallback);
        assert_eq!(report.filled, vec!["body", "title"]);
        assert_eq!(env.path().unwrap(), "/notes/#saved");

        let saved = notes.list().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].title, "Groceries");
        assert_eq!(saved[0].body, "eggs & milk");
    });

    // The note saved by the previous test was rolled back with it.
    assert!(notes.list().unwrap().is_empty());

    // Rows written on the test thread are served by the live server.
    notes.create("Written directly", "from the test").unwrap();
    env.test(|env| {
        let (page, _) = env.open("/notes/").unwrap();
        assert!(page.content.contains("<h2>Written directly</h2>"));
        assert!(!page.content.contains("<h2>Groceries</h2>"));
    });
}
