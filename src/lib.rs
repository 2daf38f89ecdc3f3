pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod feed;
pub mod heartbeat;
pub mod identity;
pub mod mail;
pub mod models;
pub mod queue;
pub mod routes;
pub mod store;
pub mod sweep;
pub mod wire;

use std::sync::Arc;

use config::Config;
use events::EventBus;
use heartbeat::HeartbeatTracker;
use identity::IdentityRegistry;
use mail::MailService;
use rocket_cors::CorsOptions;
use store::Store;

/// Build the daemon from the environment.
pub fn rocket() -> rocket::Rocket<rocket::Build> {
    build_rocket(Config::from_env(), true)
}

/// Build the daemon against an explicit data dir; the wire listener and
/// sweep task are skipped (tests drive those pieces directly).
pub fn rocket_with_data_dir(data_dir: &std::path::Path) -> rocket::Rocket<rocket::Build> {
    build_rocket(Config::with_data_dir(data_dir), false)
}

pub fn rocket_with_config(config: Config, background_tasks: bool) -> rocket::Rocket<rocket::Build> {
    build_rocket(config, background_tasks)
}

fn build_rocket(config: Config, background_tasks: bool) -> rocket::Rocket<rocket::Build> {
    std::fs::create_dir_all(&config.data_dir).ok();

    let store = Arc::new(
        Store::open(&config.db_path, config.skip_backup).expect("failed to open store"),
    );
    let events = Arc::new(EventBus::new());
    let service = Arc::new(MailService::new(Arc::clone(&store), Arc::clone(&events)));
    let registry = Arc::new(IdentityRegistry::new(
        Arc::clone(&store),
        config.identity_dir(),
    ));
    let tracker = Arc::new(HeartbeatTracker::new(
        Arc::clone(&store),
        config.active_threshold_secs,
        config.offline_threshold_secs,
    ));
    let mailbox = mail::actor::spawn(Arc::clone(&service));

    let cors = CorsOptions::default().to_cors().expect("Failed to create CORS");

    let wire_ctx = wire::WireContext {
        mailbox: mailbox.clone(),
        service: Arc::clone(&service),
        registry: Arc::clone(&registry),
        tracker: Arc::clone(&tracker),
    };
    let wire_addr = config.wire_addr.clone();
    let sweep_db = config.db_path.to_string_lossy().into_owned();
    let dedup_window = config.dedup_window_secs;

    let mut build = rocket::build()
        .manage(store)
        .manage(events)
        .manage(service)
        .manage(registry)
        .manage(tracker)
        .manage(mailbox)
        .manage(config)
        .attach(cors)
        .register(
            "/",
            rocket::catchers![
                routes::not_found,
                routes::unprocessable,
                routes::internal_error
            ],
        )
        .mount(
            "/",
            rocket::routes![
                routes::health,
                routes::stats,
                routes::register_agent,
                routes::list_agents,
                routes::get_agent,
                routes::delete_agent,
                routes::heartbeat,
                routes::heartbeat_by_name,
                routes::ensure_identity,
                routes::start_session,
                routes::end_session,
                routes::send_message,
                routes::publish_message,
                routes::inbox,
                routes::read_message,
                routes::ack_message,
                routes::update_state,
                routes::update_state_by_name,
                routes::get_thread,
                routes::agent_status,
                routes::has_unacked,
                routes::create_topic,
                routes::list_topics,
                routes::subscribe_topic,
                routes::unsubscribe_topic,
                routes::search_messages,
                routes::poll_changes,
                routes::wait_changes,
                routes::event_stream,
            ],
        );

    if background_tasks {
        build = build
            .attach(rocket::fairing::AdHoc::on_liftoff("Wire Listener", move |_rocket| {
                Box::pin(async move {
                    tokio::spawn(wire::serve(wire_ctx, wire_addr));
                    println!("🔌 Wire listener started");
                })
            }))
            .attach(rocket::fairing::AdHoc::on_liftoff("Maintenance Sweep", move |_rocket| {
                Box::pin(async move {
                    sweep::spawn_sweep_task(sweep_db, dedup_window);
                    println!("🧹 Maintenance sweep started");
                })
            }));
    }

    build
}
