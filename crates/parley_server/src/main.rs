#![forbid(unsafe_code)]

mod config;
mod quic;
mod server;
mod util;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use parley_domain::{Identity, RoomId, UserId};
use parley_store::{MemoryStore, SqlStore, Store};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::ServerConfig;
use crate::quic::QuicListenerConfig;
use crate::server::auth::Authenticator;
use crate::server::connection::{ConnectionSettings, Services, handle_connection};
use crate::server::fanout::FanoutEngine;
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::hub::{Hub, HubConfig};
use crate::server::presence::PresenceRegistry;
use crate::server::preview::{HttpPreviewFetcher, PreviewConfig, PreviewFetcher};
use crate::server::reactions::ReactionToggler;
use crate::server::rooms::RoomGate;
use crate::server::status::StatusAggregator;
use crate::server::typing::TypingNotifier;
use crate::util::endpoint::BindEndpoint;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: parley_server [--bind quic://host:port]\n\
\n\
Options:\n\
\t--bind    Bind endpoint (default: quic://127.0.0.1:18500)\n\
\t         Format: quic://host:port\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> SocketAddr {
	let mut bind_endpoint = "quic://127.0.0.1:18500".to_string();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected quic://host:port)");
					usage_and_exit();
				}
				bind_endpoint = v;
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let bind = BindEndpoint::parse(&bind_endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	bind.to_socket_addr().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	})
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,parley_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("parley_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

async fn build_store(cfg: &ServerConfig) -> anyhow::Result<Arc<dyn Store>> {
	if cfg.persistence.enabled {
		let Some(database_url) = cfg.persistence.database_url.as_deref() else {
			return Err(anyhow!("persistence enabled but no database_url configured"));
		};
		let store = SqlStore::connect(database_url).await?;
		info!("persistence: sql store connected");
		return Ok(Arc::new(store));
	}

	let store = MemoryStore::new();

	if !cfg.dev.seed_users.is_empty() || !cfg.dev.seed_rooms.is_empty() {
		warn!(
			users = cfg.dev.seed_users.len(),
			rooms = cfg.dev.seed_rooms.len(),
			"persistence disabled; seeding in-memory store from [dev] config"
		);

		for user in &cfg.dev.seed_users {
			let Ok(id) = UserId::new(user.id.clone()) else {
				warn!(raw = %user.id, "skipping dev seed user with empty id");
				continue;
			};
			store
				.insert_user(Identity {
					id,
					display_name: user.display_name.clone(),
					email: user.email.clone(),
					avatar_ref: user.avatar_ref.clone(),
				})
				.await;
		}

		for room in &cfg.dev.seed_rooms {
			let Ok(room_id) = RoomId::new(room.id.clone()) else {
				warn!(raw = %room.id, "skipping dev seed room with empty id");
				continue;
			};
			for participant in &room.participants {
				let Ok(user_id) = UserId::new(participant.clone()) else {
					continue;
				};
				store.add_participant(&room_id, &user_id).await;
			}
		}
	} else {
		warn!("persistence disabled and no [dev] seed data; connections will fail auth until users exist");
	}

	Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let bind_addr = parse_args();

	let config_path = crate::config::default_config_path()?;
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let Some(auth_secret) = server_cfg.server.auth_hmac_secret.clone() else {
		return Err(anyhow!(
			"server.auth_hmac_secret must be configured (config file or PARLEY_AUTH_HMAC_SECRET)"
		));
	};

	let store = build_store(&server_cfg).await?;

	let preview: Option<Arc<dyn PreviewFetcher>> = if server_cfg.preview.enabled {
		let mut preview_cfg = PreviewConfig {
			timeout: server_cfg.preview.timeout,
			max_redirects: server_cfg.preview.max_redirects,
			max_body_bytes: server_cfg.preview.max_body_bytes,
			..PreviewConfig::default()
		};
		if let Some(user_agent) = server_cfg.preview.user_agent.clone() {
			preview_cfg.user_agent = user_agent;
		}
		Some(Arc::new(HttpPreviewFetcher::new(preview_cfg)?))
	} else {
		info!("link preview enrichment disabled by config");
		None
	};

	let hub = Hub::new(HubConfig {
		queue_capacity: server_cfg.server.event_queue_capacity,
		debug_logs: false,
	});
	let presence = PresenceRegistry::new();
	let gate = RoomGate::new(Arc::clone(&store), hub.clone());
	let services = Arc::new(Services {
		authenticator: Authenticator::new(auth_secret, Arc::clone(&store)),
		presence,
		hub: hub.clone(),
		gate: gate.clone(),
		fanout: FanoutEngine::new(Arc::clone(&store), hub.clone(), gate.clone(), preview),
		status: StatusAggregator::new(Arc::clone(&store), hub.clone()),
		reactions: ReactionToggler::new(Arc::clone(&store), hub.clone(), gate.clone()),
		typing: TypingNotifier::new(hub.clone(), gate),
	});

	let conn_settings = ConnectionSettings {
		max_frame_bytes: server_cfg.server.max_frame_bytes,
		..ConnectionSettings::default()
	};

	let listener = QuicListenerConfig::new(bind_addr);
	let tls_paths = match (
		server_cfg.server.tls_cert_path.as_deref(),
		server_cfg.server.tls_key_path.as_deref(),
	) {
		(Some(cert), Some(key)) => Some((cert, key)),
		_ => None,
	};
	let endpoint = listener.bind(tls_paths)?;
	info!(bind = %bind_addr, "parley_server: QUIC endpoint ready");

	health_state.mark_ready();

	let mut next_conn_id: u64 = 1;

	loop {
		let Some(connecting) = endpoint.accept().await else {
			break;
		};

		let conn_id = next_conn_id;
		next_conn_id += 1;
		metrics::counter!("parley_server_connections_total").increment(1);

		let services = Arc::clone(&services);
		let conn_settings = conn_settings.clone();

		tokio::spawn(async move {
			match connecting.await {
				Ok(connection) => {
					tracing::info!(conn_id, remote = %connection.remote_address(), "accepted connection");

					if let Err(e) = handle_connection(conn_id, connection, services, conn_settings).await {
						warn!(conn_id, error = %e, "connection handler exited with error");
					}
				}
				Err(e) => {
					warn!(conn_id, error = %e, "failed to establish QUIC connection");
				}
			}
		});
	}

	Ok(())
}
