//! Registration lifecycle tests: slot moves, persistence across factory
//! restarts and scope matching against page URLs.

use std::sync::Arc;

use tempfile::TempDir;
use url::Url;

use breakwater::{CoreStorage, RegistrationFactory, Slot, WorkerState};

fn scope(text: &str) -> Url {
    Url::parse(text).unwrap()
}

fn factory_at(dir: &TempDir) -> RegistrationFactory {
    let storage = Arc::new(CoreStorage::open(&dir.path().join("core.sqlite")).unwrap());
    RegistrationFactory::new(storage)
}

#[test]
fn registrations_are_referentially_stable() {
    let dir = TempDir::new().unwrap();
    let factory = factory_at(&dir);

    let created = factory.create(&scope("https://example.com/app/")).unwrap();
    let by_scope = factory
        .get_by_scope(&scope("https://example.com/app/"))
        .unwrap()
        .unwrap();
    let by_id = factory.get_by_id(created.id()).unwrap().unwrap();
    assert!(Arc::ptr_eq(&created, &by_scope));
    assert!(Arc::ptr_eq(&created, &by_id));
}

#[test]
fn duplicate_scopes_are_rejected() {
    let dir = TempDir::new().unwrap();
    let factory = factory_at(&dir);

    factory.create(&scope("https://example.com/app/")).unwrap();
    assert!(factory.create(&scope("https://example.com/app/")).is_err());
}

#[test]
fn installing_worker_survives_a_restart() {
    let dir = TempDir::new().unwrap();
    let registration_id;
    {
        let factory = factory_at(&dir);
        let registration = factory.create(&scope("https://example.com/")).unwrap();
        registration_id = registration.id().to_string();
        let worker = factory
            .create_installing_worker(&scope("https://example.com/sw.js"), &registration)
            .unwrap();
        assert_eq!(worker.state(), WorkerState::Installing);
        assert!(registration.installing().is_some());
    }

    let factory = factory_at(&dir);
    let registration = factory.get_by_id(&registration_id).unwrap().unwrap();
    let worker = registration.installing().unwrap();
    assert_eq!(worker.url().as_str(), "https://example.com/sw.js");
    assert_eq!(worker.state(), WorkerState::Installing);
    assert!(registration.active().is_none());
}

#[test]
fn promotion_moves_a_worker_between_slots() {
    let dir = TempDir::new().unwrap();
    let factory = factory_at(&dir);
    let registration = factory.create(&scope("https://example.com/")).unwrap();
    let worker = factory
        .create_installing_worker(&scope("https://example.com/sw.js"), &registration)
        .unwrap();

    factory.workers().update_state(&worker, WorkerState::Installed).unwrap();
    factory.set_worker_slot(&registration, Slot::Waiting, &worker).unwrap();
    factory.clear_worker_slot(&registration, Slot::Installing).unwrap();

    assert!(registration.installing().is_none());
    assert!(Arc::ptr_eq(&registration.waiting().unwrap(), &worker));

    // the move is persisted, not just in memory
    let reloaded = factory_at(&dir)
        .get_by_id(registration.id())
        .unwrap()
        .unwrap();
    assert!(reloaded.installing().is_none());
    assert_eq!(reloaded.waiting().unwrap().id(), worker.id());
}

#[test]
fn a_displaced_worker_is_demoted_to_redundant() {
    let dir = TempDir::new().unwrap();
    let factory = factory_at(&dir);
    let registration = factory.create(&scope("https://example.com/")).unwrap();

    let old = factory
        .create_installing_worker(&scope("https://example.com/sw.js?v=1"), &registration)
        .unwrap();
    factory.workers().update_state(&old, WorkerState::Activated).unwrap();
    factory.set_worker_slot(&registration, Slot::Active, &old).unwrap();
    factory.clear_worker_slot(&registration, Slot::Installing).unwrap();

    let new = factory
        .create_installing_worker(&scope("https://example.com/sw.js?v=2"), &registration)
        .unwrap();
    factory.workers().update_state(&new, WorkerState::Activated).unwrap();
    factory.set_worker_slot(&registration, Slot::Active, &new).unwrap();
    factory.clear_worker_slot(&registration, Slot::Installing).unwrap();

    assert!(Arc::ptr_eq(&registration.active().unwrap(), &new));
    assert!(Arc::ptr_eq(&registration.redundant().unwrap(), &old));
    assert_eq!(old.state(), WorkerState::Redundant);

    let reloaded = factory_at(&dir)
        .get_by_id(registration.id())
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.active().unwrap().id(), new.id());
    assert_eq!(reloaded.redundant().unwrap().id(), old.id());
    assert_eq!(reloaded.redundant().unwrap().state(), WorkerState::Redundant);
}

#[test]
fn a_failed_install_deletes_the_worker_row() {
    let dir = TempDir::new().unwrap();
    let factory = factory_at(&dir);
    let registration = factory.create(&scope("https://example.com/")).unwrap();
    let worker = factory
        .create_installing_worker(&scope("https://example.com/sw.js"), &registration)
        .unwrap();
    let worker_id = worker.id().to_string();

    factory.clear_installing_worker(&registration).unwrap();
    assert!(registration.installing().is_none());
    assert_eq!(worker.state(), WorkerState::Redundant);

    let restarted = factory_at(&dir);
    assert!(restarted.workers().get(&worker_id).unwrap().is_none());
    let reloaded = restarted.get_by_id(registration.id()).unwrap().unwrap();
    assert!(reloaded.installing().is_none());

    // clearing again without an installing worker is an error
    assert!(factory.clear_installing_worker(&registration).is_err());
}

#[test]
fn page_urls_match_the_longest_registered_scope() {
    let dir = TempDir::new().unwrap();
    let factory = factory_at(&dir);
    let root = factory.create(&scope("https://example.com/")).unwrap();
    let app = factory.create(&scope("https://example.com/app/")).unwrap();

    let for_app_page = factory
        .get_for_page_url(&scope("https://example.com/app/page.html"))
        .unwrap()
        .unwrap();
    assert!(Arc::ptr_eq(&for_app_page, &app));

    let for_other_page = factory
        .get_for_page_url(&scope("https://example.com/other/page.html"))
        .unwrap()
        .unwrap();
    assert!(Arc::ptr_eq(&for_other_page, &root));

    assert!(factory
        .get_for_page_url(&scope("https://elsewhere.com/page.html"))
        .unwrap()
        .is_none());
}

#[test]
fn all_registrations_within_an_origin() {
    let dir = TempDir::new().unwrap();
    let factory = factory_at(&dir);
    factory.create(&scope("https://example.com/a/")).unwrap();
    factory.create(&scope("https://example.com/b/")).unwrap();
    factory.create(&scope("https://elsewhere.com/c/")).unwrap();

    let within = factory
        .get_all_within_origin(&scope("https://example.com/"))
        .unwrap();
    assert_eq!(within.len(), 2);
}

#[test]
fn ready_requires_an_activated_active_worker() {
    let dir = TempDir::new().unwrap();
    let factory = factory_at(&dir);
    let registration = factory.create(&scope("https://example.com/app/")).unwrap();
    let page = scope("https://example.com/app/index.html");

    assert!(factory.get_ready_registration(&page).unwrap().is_none());

    let worker = factory
        .create_installing_worker(&scope("https://example.com/app/sw.js"), &registration)
        .unwrap();
    factory.set_worker_slot(&registration, Slot::Active, &worker).unwrap();
    factory.clear_worker_slot(&registration, Slot::Installing).unwrap();

    // active slot alone is not enough until the worker reaches activated
    assert!(factory.get_ready_registration(&page).unwrap().is_none());

    factory.workers().update_state(&worker, WorkerState::Activated).unwrap();
    let ready = factory.get_ready_registration(&page).unwrap().unwrap();
    assert!(Arc::ptr_eq(&ready, &registration));
}

#[test]
fn skip_waiting_persists() {
    let dir = TempDir::new().unwrap();
    let factory = factory_at(&dir);
    let registration = factory.create(&scope("https://example.com/")).unwrap();
    let worker = factory
        .create_installing_worker(&scope("https://example.com/sw.js"), &registration)
        .unwrap();

    factory.workers().set_skip_waiting(&worker, true).unwrap();
    assert!(worker.skip_waiting());

    let reloaded = factory_at(&dir)
        .get_by_id(registration.id())
        .unwrap()
        .unwrap();
    assert!(reloaded.installing().unwrap().skip_waiting());
}

#[test]
fn deleting_a_registration_removes_it_from_storage() {
    let dir = TempDir::new().unwrap();
    let factory = factory_at(&dir);
    let registration = factory.create(&scope("https://example.com/")).unwrap();
    factory
        .create_installing_worker(&scope("https://example.com/sw.js"), &registration)
        .unwrap();

    factory.delete(&registration).unwrap();
    assert!(factory
        .get_by_scope(&scope("https://example.com/"))
        .unwrap()
        .is_none());

    let restarted = factory_at(&dir);
    assert!(restarted.get_by_id(registration.id()).unwrap().is_none());
}
