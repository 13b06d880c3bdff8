use std::collections::HashSet;
use std::env;
use std::str::FromStr;

use snafu::{OptionExt, ResultExt, Snafu};

use murmur_storage::{
    ChatId, MessageId, MessageSender, MessageStore, NewChat, NewMessage, ProfileStore,
    SessionIndex, SqliteStorage, StorageError, UserId, UserProfile,
};

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    db_path: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    IdRoundtrip,
    IdInvalid,
    SchemaInit,
    ChatCreateAtomic,
    AppendOrder,
    FeedSnapshot,
    ProfileRoundtrip,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "id_roundtrip" => Some(Self::IdRoundtrip),
            "id_invalid" => Some(Self::IdInvalid),
            "schema_init" => Some(Self::SchemaInit),
            "chat_create_atomic" => Some(Self::ChatCreateAtomic),
            "append_order" => Some(Self::AppendOrder),
            "feed_snapshot" => Some(Self::FeedSnapshot),
            "profile_roundtrip" => Some(Self::ProfileRoundtrip),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::IdRoundtrip => "id_roundtrip",
            Self::IdInvalid => "id_invalid",
            Self::SchemaInit => "schema_init",
            Self::ChatCreateAtomic => "chat_create_atomic",
            Self::AppendOrder => "append_order",
            Self::FeedSnapshot => "feed_snapshot",
            Self::ProfileRoundtrip => "profile_roundtrip",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required --scenario argument"))]
    MissingScenario { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("missing required --db argument for scenario '{scenario}'"))]
    MissingDbPath {
        stage: &'static str,
        scenario: &'static str,
    },
    #[snafu(display("storage validation failed: {source}"))]
    StorageValidation {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("sqlite query failed: {source}"))]
    SqliteQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    println!("scenario={}", args.scenario.name());
    if let Some(db_path) = args.db_path.as_deref() {
        println!("db_path={db_path}");
    }

    match args.scenario {
        Scenario::IdRoundtrip => run_id_roundtrip(),
        Scenario::IdInvalid => run_id_invalid(),
        Scenario::SchemaInit => run_schema_init(require_db_path(&args, "schema_init")?).await,
        Scenario::ChatCreateAtomic => {
            run_chat_create_atomic(require_db_path(&args, "chat_create_atomic")?).await
        }
        Scenario::AppendOrder => run_append_order(require_db_path(&args, "append_order")?).await,
        Scenario::FeedSnapshot => run_feed_snapshot(require_db_path(&args, "feed_snapshot")?).await,
        Scenario::ProfileRoundtrip => {
            run_profile_roundtrip(require_db_path(&args, "profile_roundtrip")?).await
        }
        Scenario::All => run_all(args.db_path.as_deref()).await,
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut db_path = None;
    let mut pending = args.into_iter();

    // The parser is intentionally strict to keep scenario execution deterministic in CI.
    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--scenario" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-scenario-value",
                    arg: "--scenario",
                })?;

                let parsed = Scenario::parse(&value).context(UnknownScenarioSnafu {
                    stage: "parse-args-scenario",
                    raw: value,
                })?;
                scenario = Some(parsed);
            }
            "--db" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-db-value",
                    arg: "--db",
                })?;
                db_path = Some(value);
            }
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(RunnerArgs {
        scenario: scenario.context(MissingScenarioSnafu {
            stage: "parse-args-scenario-required",
        })?,
        db_path,
    })
}

async fn run_all(db_path: Option<&str>) -> RunnerResult<()> {
    run_id_roundtrip()?;
    run_id_invalid()?;

    if let Some(path) = db_path {
        run_schema_init(path).await?;
        run_chat_create_atomic(path).await?;
        run_append_order(path).await?;
        run_feed_snapshot(path).await?;
        run_profile_roundtrip(path).await?;
    }

    println!("all_passed=true");
    Ok(())
}

fn run_id_roundtrip() -> RunnerResult<()> {
    assert_id_roundtrip("user_id", UserId::new_v7())?;
    assert_id_roundtrip("chat_id", ChatId::new_v7())?;
    assert_id_roundtrip("message_id", MessageId::new_v7())?;
    println!("id_roundtrip=true");
    println!("runner_ok=true");
    Ok(())
}

fn run_id_invalid() -> RunnerResult<()> {
    let invalid_input = "not-a-valid-uuid";
    let invalid_id_error = invalid_input_is_rejected::<UserId>(invalid_input)
        && invalid_input_is_rejected::<ChatId>(invalid_input)
        && invalid_input_is_rejected::<MessageId>(invalid_input);

    println!("invalid_id_error={invalid_id_error}");
    if !invalid_id_error {
        return ScenarioFailedSnafu {
            stage: "scenario-id-invalid",
            scenario: "id_invalid",
            reason: "at least one ID wrapper accepted malformed UUID input".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_schema_init(db_path: &str) -> RunnerResult<()> {
    let storage = SqliteStorage::open(db_path)
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-schema-init-open",
        })?;
    let pool = storage.pool();

    let discovered_tables = sqlx::query_scalar::<_, String>(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('users', 'chats', 'session_index', 'messages')",
    )
    .fetch_all(pool)
    .await
    .context(SqliteQuerySnafu {
        stage: "scenario-schema-init-list-tables",
    })?;

    let required_tables = ["users", "chats", "session_index", "messages"];
    let available_tables: HashSet<String> = discovered_tables.into_iter().collect();
    let schema_ok = required_tables
        .iter()
        .all(|table_name| available_tables.contains(*table_name));

    let journal_mode = sqlx::query_scalar::<_, String>("PRAGMA journal_mode;")
        .fetch_one(pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "scenario-schema-init-journal-mode",
        })?
        .to_lowercase();
    let foreign_keys = sqlx::query_scalar::<_, i64>("PRAGMA foreign_keys;")
        .fetch_one(pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "scenario-schema-init-foreign-keys",
        })?;

    println!("schema_ok={schema_ok}");
    println!("journal_mode={journal_mode}");
    println!("foreign_keys={foreign_keys}");

    if !schema_ok {
        return ScenarioFailedSnafu {
            stage: "scenario-schema-init-assert-schema",
            scenario: "schema_init",
            reason: "expected migration tables are missing".to_string(),
        }
        .fail();
    }

    if journal_mode != "wal" {
        return ScenarioFailedSnafu {
            stage: "scenario-schema-init-assert-journal-mode",
            scenario: "schema_init",
            reason: format!("expected journal_mode=wal but was {journal_mode}"),
        }
        .fail();
    }

    if foreign_keys != 1 {
        return ScenarioFailedSnafu {
            stage: "scenario-schema-init-assert-foreign-keys",
            scenario: "schema_init",
            reason: format!("expected foreign_keys=1 but was {foreign_keys}"),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_chat_create_atomic(db_path: &str) -> RunnerResult<()> {
    let storage = SqliteStorage::open(db_path)
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-chat-create-atomic-open",
        })?;
    let user = UserId::new_v7();

    let chat = storage
        .create_chat(
            user,
            NewChat {
                title: "atomic-create".to_string(),
            },
        )
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-chat-create-atomic-create",
        })?;

    let index_rows = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM session_index WHERE user_id = ? AND chat_id = ?",
    )
    .bind(user.to_string())
    .bind(chat.id.to_string())
    .fetch_one(storage.pool())
    .await
    .context(SqliteQuerySnafu {
        stage: "scenario-chat-create-atomic-count-index",
    })?;

    let chat_rows = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM chats WHERE id = ?")
        .bind(chat.id.to_string())
        .fetch_one(storage.pool())
        .await
        .context(SqliteQuerySnafu {
            stage: "scenario-chat-create-atomic-count-chats",
        })?;

    let atomic_create = index_rows == 1 && chat_rows == 1;

    println!("index_rows={index_rows}");
    println!("chat_rows={chat_rows}");
    println!("atomic_create={atomic_create}");

    if !atomic_create {
        return ScenarioFailedSnafu {
            stage: "scenario-chat-create-atomic-assert",
            scenario: "chat_create_atomic",
            reason: format!(
                "expected exactly one row in each location, got index_rows={index_rows}, chat_rows={chat_rows}"
            ),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_append_order(db_path: &str) -> RunnerResult<()> {
    let storage = SqliteStorage::open(db_path)
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-append-order-open",
        })?;
    let user = UserId::new_v7();

    let chat = storage
        .create_chat(
            user,
            NewChat {
                title: "append-order".to_string(),
            },
        )
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-append-order-create",
        })?;

    for (sender, body) in [
        (MessageSender::User, "first"),
        (MessageSender::Bot, "second"),
        (MessageSender::User, "third"),
    ] {
        storage
            .append_message(
                chat.id,
                NewMessage {
                    sender,
                    body: body.to_string(),
                },
            )
            .await
            .context(StorageValidationSnafu {
                stage: "scenario-append-order-append",
            })?;
    }

    let messages = storage
        .list_messages(chat.id)
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-append-order-list",
        })?;

    let bodies = messages
        .iter()
        .map(|message| message.body.as_str())
        .collect::<Vec<_>>();
    let seqs = messages
        .iter()
        .map(|message| message.seq)
        .collect::<Vec<_>>();
    let order_ok = bodies == vec!["first", "second", "third"] && seqs == vec![1, 2, 3];

    println!("message_count={}", messages.len());
    println!("order_ok={order_ok}");

    if !order_ok {
        return ScenarioFailedSnafu {
            stage: "scenario-append-order-assert",
            scenario: "append_order",
            reason: format!("append order not preserved: bodies={bodies:?}, seqs={seqs:?}"),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_feed_snapshot(db_path: &str) -> RunnerResult<()> {
    let storage = SqliteStorage::open(db_path)
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-feed-snapshot-open",
        })?;
    let user = UserId::new_v7();

    let chat = storage
        .create_chat(
            user,
            NewChat {
                title: "feed-snapshot".to_string(),
            },
        )
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-feed-snapshot-create",
        })?;

    let mut feed = storage
        .subscribe_messages(chat.id)
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-feed-snapshot-subscribe",
        })?;

    storage
        .append_message(chat.id, NewMessage::user("hello"))
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-feed-snapshot-append",
        })?;

    let Some(delivery) = feed.changed().await else {
        return ScenarioFailedSnafu {
            stage: "scenario-feed-snapshot-changed",
            scenario: "feed_snapshot",
            reason: "feed closed before delivering a snapshot".to_string(),
        }
        .fail();
    };

    let snapshot_full = delivery.len() == 1 && delivery[0].body == "hello";

    println!("delivery_len={}", delivery.len());
    println!("snapshot_full={snapshot_full}");

    if !snapshot_full {
        return ScenarioFailedSnafu {
            stage: "scenario-feed-snapshot-assert",
            scenario: "feed_snapshot",
            reason: "feed delivery was not the full current snapshot".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_profile_roundtrip(db_path: &str) -> RunnerResult<()> {
    let storage = SqliteStorage::open(db_path)
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-profile-roundtrip-open",
        })?;
    let user = UserId::new_v7();

    storage
        .upsert_profile(UserProfile {
            id: user,
            display_name: "QA User".to_string(),
            email: "qa@example.com".to_string(),
            avatar_url: None,
        })
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-profile-roundtrip-upsert",
        })?;

    let profile = storage
        .get_profile(user)
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-profile-roundtrip-get",
        })?;

    let profile_roundtrip = profile
        .as_ref()
        .is_some_and(|profile| profile.display_name == "QA User");

    println!("profile_roundtrip={profile_roundtrip}");

    if !profile_roundtrip {
        return ScenarioFailedSnafu {
            stage: "scenario-profile-roundtrip-assert",
            scenario: "profile_roundtrip",
            reason: "stored profile did not round-trip".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

fn assert_id_roundtrip<T>(label: &'static str, id: T) -> RunnerResult<()>
where
    T: Copy + Eq + FromStr<Err = StorageError> + std::fmt::Display,
{
    let encoded = id.to_string();
    let decoded = encoded.parse::<T>().context(StorageValidationSnafu {
        stage: "scenario-id-roundtrip-parse",
    })?;

    if decoded != id {
        return ScenarioFailedSnafu {
            stage: "scenario-id-roundtrip-compare",
            scenario: "id_roundtrip",
            reason: format!("{label} parse/format roundtrip mismatch"),
        }
        .fail();
    }

    println!("{label}_roundtrip=true");
    Ok(())
}

fn invalid_input_is_rejected<T>(raw: &str) -> bool
where
    T: FromStr<Err = StorageError>,
{
    matches!(raw.parse::<T>(), Err(StorageError::InvalidId { .. }))
}

fn require_db_path<'a>(args: &'a RunnerArgs, scenario: &'static str) -> RunnerResult<&'a str> {
    args.db_path.as_deref().context(MissingDbPathSnafu {
        stage: "require-db-path",
        scenario,
    })
}
