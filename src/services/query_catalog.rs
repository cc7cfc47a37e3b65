//! Built-in query catalog
//!
//! Every collectible query the scrapers know about, per engine and per
//! telemetry category. Each category keeps a universal low-priority
//! fallback with no extension requirements, so degraded databases still
//! produce a minimal signal.
//!
//! Column convention: the first numeric column of a result row is the
//! metric value; every other column becomes a typed data-point attribute.

use crate::models::{DatabaseKind, QueryCategory, QueryDefinition, Requirement};

fn query(
    category: QueryCategory,
    kind: DatabaseKind,
    name: &str,
    priority: i32,
    description: &str,
    sql: &str,
    requirements: Vec<Requirement>,
) -> QueryDefinition {
    let mut requirements = requirements;
    requirements.push(Requirement::Kind(kind));
    QueryDefinition {
        category,
        name: name.to_string(),
        sql: sql.trim().to_string(),
        priority,
        description: description.to_string(),
        requirements,
    }
}

fn ext(name: &str) -> Requirement {
    Requirement::Extension(name.to_string())
}

fn cap(name: &str) -> Requirement {
    Requirement::Capability(name.to_string())
}

/// The full built-in catalog for both engines
pub fn builtin_queries() -> Vec<QueryDefinition> {
    let mut queries = Vec::new();
    queries.extend(postgres_queries());
    queries.extend(mysql_queries());
    queries
}

/// Hard-coded minimal set used when selection yields nothing for the
/// metrics category (e.g. before the first feature detection completes)
pub fn minimal_fallback(kind: DatabaseKind) -> Vec<QueryDefinition> {
    match kind {
        DatabaseKind::Postgres => vec![
            query(
                QueryCategory::Metrics,
                kind,
                "db.size",
                0,
                "Database size in bytes",
                "SELECT pg_database_size(current_database())::float8 AS size_bytes",
                vec![],
            ),
            query(
                QueryCategory::Metrics,
                kind,
                "db.connections",
                0,
                "Connection count by state",
                "SELECT count(*)::float8 AS connections, COALESCE(state, 'unknown') AS state \
                 FROM pg_stat_activity GROUP BY state",
                vec![],
            ),
        ],
        DatabaseKind::MySql => vec![
            query(
                QueryCategory::Metrics,
                kind,
                "db.size",
                0,
                "Database size in bytes",
                "SELECT CAST(COALESCE(SUM(data_length + index_length), 0) AS SIGNED) AS size_bytes \
                 FROM information_schema.tables WHERE table_schema = DATABASE()",
                vec![],
            ),
            query(
                QueryCategory::Metrics,
                kind,
                "db.connections",
                0,
                "Connection count by command",
                "SELECT COUNT(*) AS connections, command FROM information_schema.processlist GROUP BY command",
                vec![],
            ),
        ],
    }
}

fn postgres_queries() -> Vec<QueryDefinition> {
    use DatabaseKind::Postgres as PG;
    use QueryCategory::*;

    vec![
        // ------------------------------------------------------------------
        // Metrics
        // ------------------------------------------------------------------
        query(
            Metrics,
            PG,
            "db.size",
            10,
            "Database size in bytes (universal fallback)",
            "SELECT pg_database_size(current_database())::float8 AS size_bytes",
            vec![],
        ),
        query(
            Metrics,
            PG,
            "db.connections.by_state",
            10,
            "Session count grouped by state",
            "SELECT count(*)::float8 AS connections, COALESCE(state, 'unknown') AS state \
             FROM pg_stat_activity GROUP BY state",
            vec![],
        ),
        query(
            Metrics,
            PG,
            "db.transactions",
            60,
            "Commit/rollback counters for the current database",
            "SELECT xact_commit::float8 AS commits, xact_rollback::float8 AS rollbacks, \
                    blks_read::float8 AS blocks_read, blks_hit::float8 AS blocks_hit, \
                    tup_returned::float8 AS tuples_returned, deadlocks::float8 AS deadlocks \
             FROM pg_stat_database WHERE datname = current_database()",
            vec![cap("pg_stat_database")],
        ),
        query(
            Metrics,
            PG,
            "db.statements.mean_time",
            100,
            "Per-statement mean execution time from pg_stat_statements",
            "SELECT mean_exec_time AS mean_time_ms, queryid::text AS query_id, \
                    calls::float8 AS calls, total_exec_time AS total_time_ms, \
                    rows::float8 AS rows, shared_blks_read::float8 AS shared_blocks_read, \
                    temp_blks_written::float8 AS temp_blocks_written, query AS query_text \
             FROM pg_stat_statements \
             WHERE dbid = (SELECT oid FROM pg_database WHERE datname = current_database()) \
             ORDER BY total_exec_time DESC LIMIT 50",
            vec![ext("pg_stat_statements")],
        ),
        query(
            Metrics,
            PG,
            "db.bgwriter.checkpoints",
            50,
            "Background writer and checkpoint activity",
            "SELECT checkpoints_timed::float8 AS checkpoints_timed, \
                    checkpoints_req::float8 AS checkpoints_requested, \
                    buffers_checkpoint::float8 AS buffers_checkpoint, \
                    buffers_clean::float8 AS buffers_clean \
             FROM pg_stat_bgwriter",
            vec![cap("pg_stat_bgwriter")],
        ),
        // ------------------------------------------------------------------
        // Logs (slow queries)
        // ------------------------------------------------------------------
        query(
            Logs,
            PG,
            "slow_queries",
            100,
            "Statements slower than 100ms mean time",
            "SELECT mean_exec_time AS mean_time_ms, queryid::text AS query_id, \
                    calls::float8 AS calls, query AS query_text \
             FROM pg_stat_statements \
             WHERE mean_exec_time > 100 \
             ORDER BY mean_exec_time DESC LIMIT 20",
            vec![ext("pg_stat_statements")],
        ),
        query(
            Logs,
            PG,
            "long_running_queries",
            10,
            "Queries running longer than 30s right now (universal fallback)",
            "SELECT EXTRACT(EPOCH FROM (now() - query_start))::float8 AS elapsed_secs, \
                    pid::float8 AS pid, usename AS username, state, query AS query_text \
             FROM pg_stat_activity \
             WHERE state = 'active' AND query_start < now() - interval '30 seconds'",
            vec![],
        ),
        // ------------------------------------------------------------------
        // ASH (who is active right now)
        // ------------------------------------------------------------------
        query(
            Ash,
            PG,
            "active_sessions",
            50,
            "Point-in-time session snapshot (universal fallback)",
            "SELECT pid, state, wait_event_type, wait_event, \
                    query_id::text AS query_id, query_start, query AS query_text, \
                    (pg_blocking_pids(pid))[1] AS blocked_by \
             FROM pg_stat_activity \
             WHERE backend_type = 'client backend'",
            vec![],
        ),
        // ------------------------------------------------------------------
        // Waits
        // ------------------------------------------------------------------
        query(
            Waits,
            PG,
            "wait_sampling.profile",
            100,
            "Accumulated wait profile from pg_wait_sampling",
            "SELECT count::float8 AS wait_count, event_type AS wait_event_type, event AS wait_event \
             FROM pg_wait_sampling_profile WHERE event IS NOT NULL \
             ORDER BY count DESC LIMIT 100",
            vec![ext("pg_wait_sampling")],
        ),
        query(
            Waits,
            PG,
            "wait_events.current",
            10,
            "Sessions currently waiting, by event (universal fallback)",
            "SELECT count(*)::float8 AS waiting_sessions, wait_event_type, wait_event \
             FROM pg_stat_activity \
             WHERE wait_event IS NOT NULL GROUP BY wait_event_type, wait_event",
            vec![],
        ),
        // ------------------------------------------------------------------
        // Plans
        // ------------------------------------------------------------------
        query(
            Plans,
            PG,
            "plan_statistics",
            100,
            "Per-statement timing used for plan history when auto_explain payloads arrive",
            "SELECT mean_exec_time AS mean_time_ms, queryid::text AS query_id, \
                    calls::float8 AS calls, rows::float8 AS rows, \
                    shared_blks_read::float8 AS disk_reads, temp_blks_written::float8 AS temp_blocks, \
                    query AS query_text \
             FROM pg_stat_statements \
             ORDER BY total_exec_time DESC LIMIT 25",
            vec![ext("pg_stat_statements")],
        ),
        query(
            Plans,
            PG,
            "plan_activity",
            10,
            "Active statements for plan correlation (universal fallback)",
            "SELECT EXTRACT(EPOCH FROM (now() - query_start))::float8 AS elapsed_secs, \
                    query_id::text AS query_id, query AS query_text \
             FROM pg_stat_activity WHERE state = 'active' AND query_id IS NOT NULL",
            vec![],
        ),
    ]
}

fn mysql_queries() -> Vec<QueryDefinition> {
    use DatabaseKind::MySql as MY;
    use QueryCategory::*;

    vec![
        // ------------------------------------------------------------------
        // Metrics
        // ------------------------------------------------------------------
        query(
            Metrics,
            MY,
            "db.size",
            10,
            "Database size in bytes (universal fallback)",
            "SELECT CAST(COALESCE(SUM(data_length + index_length), 0) AS SIGNED) AS size_bytes \
             FROM information_schema.tables WHERE table_schema = DATABASE()",
            vec![],
        ),
        query(
            Metrics,
            MY,
            "db.connections.by_command",
            10,
            "Session count grouped by command",
            "SELECT COUNT(*) AS connections, command FROM information_schema.processlist GROUP BY command",
            vec![],
        ),
        query(
            Metrics,
            MY,
            "db.statements.digest",
            100,
            "Per-digest latency from the performance schema",
            "SELECT AVG_TIMER_WAIT / 1e9 AS mean_time_ms, DIGEST AS query_id, \
                    COUNT_STAR AS calls, SUM_TIMER_WAIT / 1e9 AS total_time_ms, \
                    SUM_ROWS_SENT AS rows_sent, SUM_CREATED_TMP_DISK_TABLES AS tmp_disk_tables, \
                    DIGEST_TEXT AS query_text \
             FROM performance_schema.events_statements_summary_by_digest \
             WHERE SCHEMA_NAME = DATABASE() \
             ORDER BY SUM_TIMER_WAIT DESC LIMIT 50",
            vec![cap("events_statements_summary_by_digest")],
        ),
        query(
            Metrics,
            MY,
            "db.innodb.buffer_pool",
            50,
            "InnoDB buffer pool status",
            "SELECT VARIABLE_VALUE + 0 AS pages_free, 'buffer_pool_pages_free' AS variable \
             FROM performance_schema.global_status \
             WHERE VARIABLE_NAME = 'Innodb_buffer_pool_pages_free'",
            vec![cap("performance_schema")],
        ),
        // ------------------------------------------------------------------
        // Logs (slow queries)
        // ------------------------------------------------------------------
        query(
            Logs,
            MY,
            "slow_queries",
            100,
            "Digests slower than 100ms mean time",
            "SELECT AVG_TIMER_WAIT / 1e9 AS mean_time_ms, DIGEST AS query_id, \
                    COUNT_STAR AS calls, DIGEST_TEXT AS query_text \
             FROM performance_schema.events_statements_summary_by_digest \
             WHERE AVG_TIMER_WAIT > 1e11 \
             ORDER BY AVG_TIMER_WAIT DESC LIMIT 20",
            vec![cap("events_statements_summary_by_digest")],
        ),
        query(
            Logs,
            MY,
            "long_running_queries",
            10,
            "Statements running longer than 30s right now (universal fallback)",
            "SELECT time AS elapsed_secs, id AS session_id, user AS username, state, info AS query_text \
             FROM information_schema.processlist \
             WHERE command != 'Sleep' AND time > 30",
            vec![],
        ),
        // ------------------------------------------------------------------
        // ASH
        // ------------------------------------------------------------------
        query(
            Ash,
            MY,
            "processlist",
            10,
            "Point-in-time session snapshot (universal fallback)",
            "SELECT id AS pid, state, command, time AS elapsed_secs, info AS query_text \
             FROM information_schema.processlist",
            vec![],
        ),
        query(
            Ash,
            MY,
            "threads_with_waits",
            100,
            "Session snapshot joined with current wait events",
            "SELECT t.processlist_id AS pid, t.processlist_state AS state, \
                    t.processlist_command AS command, w.event_name AS wait_event, \
                    t.processlist_info AS query_text \
             FROM performance_schema.threads t \
             LEFT JOIN performance_schema.events_waits_current w ON w.thread_id = t.thread_id \
             WHERE t.processlist_id IS NOT NULL",
            vec![cap("events_waits_current")],
        ),
        // ------------------------------------------------------------------
        // Waits
        // ------------------------------------------------------------------
        query(
            Waits,
            MY,
            "waits.summary",
            100,
            "Accumulated wait summary from the performance schema",
            "SELECT COUNT_STAR AS wait_count, EVENT_NAME AS wait_event, \
                    SUM_TIMER_WAIT / 1e9 AS total_wait_ms \
             FROM performance_schema.events_waits_summary_global_by_event_name \
             WHERE COUNT_STAR > 0 AND EVENT_NAME != 'idle' \
             ORDER BY SUM_TIMER_WAIT DESC LIMIT 100",
            vec![cap("performance_schema")],
        ),
        query(
            Waits,
            MY,
            "waits.by_state",
            10,
            "Sessions grouped by processlist state (universal fallback)",
            "SELECT COUNT(*) AS waiting_sessions, state \
             FROM information_schema.processlist \
             WHERE state != '' GROUP BY state",
            vec![],
        ),
        // ------------------------------------------------------------------
        // Plans
        // ------------------------------------------------------------------
        query(
            Plans,
            MY,
            "plan_statistics",
            100,
            "Per-digest statistics used for plan history",
            "SELECT AVG_TIMER_WAIT / 1e9 AS mean_time_ms, DIGEST AS query_id, \
                    COUNT_STAR AS calls, SUM_ROWS_EXAMINED AS rows_examined, \
                    SUM_CREATED_TMP_DISK_TABLES AS tmp_disk_tables, DIGEST_TEXT AS query_text \
             FROM performance_schema.events_statements_summary_by_digest \
             ORDER BY SUM_TIMER_WAIT DESC LIMIT 25",
            vec![cap("events_statements_summary_by_digest")],
        ),
        query(
            Plans,
            MY,
            "plan_activity",
            10,
            "Active statements for plan correlation (universal fallback)",
            "SELECT time AS elapsed_secs, id AS session_id, info AS query_text \
             FROM information_schema.processlist WHERE info IS NOT NULL",
            vec![],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_category_has_universal_fallback_per_engine() {
        let catalog = builtin_queries();
        for kind in [DatabaseKind::Postgres, DatabaseKind::MySql] {
            for category in [QueryCategory::Metrics, QueryCategory::Logs, QueryCategory::Ash, QueryCategory::Waits, QueryCategory::Plans] {
                let has_fallback = catalog.iter().any(|q| {
                    q.category == category
                        && q.requirements.iter().all(|r| matches!(r, Requirement::Kind(k) if *k == kind))
                });
                assert!(has_fallback, "no universal fallback for {:?}/{:?}", kind, category);
            }
        }
    }

    #[test]
    fn test_catalog_is_select_only() {
        for q in builtin_queries() {
            let upper = q.sql.to_uppercase();
            assert!(upper.starts_with("SELECT"), "{} is not a SELECT", q.name);
            for forbidden in ["INSERT ", "UPDATE ", "DELETE ", "DROP ", "ALTER ", "CREATE "] {
                assert!(!upper.contains(forbidden), "{} contains {}", q.name, forbidden);
            }
        }
    }

    #[test]
    fn test_minimal_fallback_exists_for_both_engines() {
        assert!(!minimal_fallback(DatabaseKind::Postgres).is_empty());
        assert!(!minimal_fallback(DatabaseKind::MySql).is_empty());
    }
}
