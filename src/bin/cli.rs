//! EmberDB - CLI Client
//!
//! `emberdb-cli [OPTIONS] <DB_DIR> [-c SQL | -f FILE]`

use std::env;
use std::fs;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing_subscriber::EnvFilter;

use emberdb::catalog::Catalog;
use emberdb::sql::{parse_statement, Statement};
use emberdb::{Engine, Error, ErrorKind, Options, QueryResult, Transaction, TransactionState, Tuple};

const EXIT_OK: i32 = 0;
const EXIT_USAGE: i32 = 1;
const EXIT_STATEMENT: i32 = 2;
const EXIT_CORRUPT: i32 = 3;
const EXIT_CANCELLED: i32 = 4;

const HISTORY_FILE: &str = ".emberdb_history";

/// Print welcome banner
fn print_banner() {
    println!(
        r#"
 _____           _               ____  ____
| ____|_ __ ___ | |__   ___ _ __|  _ \| __ )
|  _| | '_ ` _ \| '_ \ / _ \ '__| | | |  _ \
| |___| | | | | | |_) |  __/ |  | |_| | |_) |
|_____|_| |_| |_|_.__/ \___|_|  |____/|____/

 An embedded MVCC relational engine in Rust
 Type '.help' for help, '.quit' to exit
"#
    );
}

/// Print help message
fn print_help() {
    println!(
        r#"
Commands:
  .help              Show this help message
  .quit              Exit EmberDB
  .tables            List all tables
  .schema [table]    Show table schema
  .indexes [table]   List indexes
  .check             Verify page checksums and indexes
  .vacuum [table]    Reclaim dead row versions
  .analyze [table]   Refresh planner statistics

SQL Commands:
  CREATE TABLE ...   Create a new table
  CREATE INDEX ...   Create an index
  DROP TABLE ...     Drop a table
  DROP INDEX ...     Drop a secondary index
  INSERT INTO ...    Insert rows
  SELECT ...         Query data
  UPDATE ...         Update rows
  DELETE FROM ...    Delete rows
  EXPLAIN SELECT ... Show the query plan
  BEGIN / COMMIT / ROLLBACK

Examples:
  CREATE TABLE users (id INT PRIMARY KEY, name VARCHAR, email VARCHAR UNIQUE);
  INSERT INTO users VALUES (1, 'Alice', 'a@x'), (2, 'Bob', 'b@x');
  SELECT * FROM users WHERE id = 1;
"#
    );
}

fn print_usage() {
    eprintln!(
        "usage: emberdb-cli [--page-size N] [--pool-pages N] [--sync off|normal|full] \
         [--lock-timeout-ms N] <DB_DIR> [-c SQL | -f FILE]"
    );
}

/// Format query results as a table
fn format_results(columns: &[String], rows: &[Tuple]) -> String {
    if columns.is_empty() && rows.is_empty() {
        return String::new();
    }

    let mut widths: Vec<usize> = columns.iter().map(|c| c.len()).collect();
    for row in rows {
        for (i, value) in row.values().iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(value.to_string().len());
            }
        }
    }

    let mut output = String::new();

    let separator: String = widths
        .iter()
        .map(|w| "-".repeat(*w + 2))
        .collect::<Vec<_>>()
        .join("+");
    let separator = format!("+{}+\n", separator);

    output.push_str(&separator);
    let header: String = columns
        .iter()
        .zip(&widths)
        .map(|(c, w)| format!(" {:^width$} ", c, width = *w))
        .collect::<Vec<_>>()
        .join("|");
    output.push_str(&format!("|{}|\n", header));
    output.push_str(&separator);

    for row in rows {
        let row_str: String = row
            .values()
            .iter()
            .zip(&widths)
            .map(|(v, w)| format!(" {:>width$} ", v.to_string(), width = *w))
            .collect::<Vec<_>>()
            .join("|");
        output.push_str(&format!("|{}|\n", row_str));
    }

    if !rows.is_empty() {
        output.push_str(&separator);
    }

    output.push_str(&format!("{} row(s) returned\n", rows.len()));
    output
}

/// One line per index: `table.index (columns) [PRIMARY|UNIQUE]`
fn format_indexes(catalog: &Catalog, table: Option<&str>) -> emberdb::Result<String> {
    let listed = match table {
        Some(name) => {
            let def = catalog.get_table(name)?;
            def.indexes.iter().map(|idx| (def.name.clone(), idx.clone())).collect()
        }
        None => catalog.list_indexes(),
    };
    let mut out = String::new();
    for (table, idx) in listed {
        let def = catalog.get_table(&table)?;
        let columns: Vec<&str> = idx
            .columns
            .iter()
            .map(|&i| def.columns()[i].name.as_str())
            .collect();
        let kind = if idx.primary {
            " PRIMARY"
        } else if idx.unique {
            " UNIQUE"
        } else {
            ""
        };
        out.push_str(&format!("  {}.{} ({}){}\n", def.name, idx.name, columns.join(", "), kind));
    }
    Ok(out)
}

fn print_result(result: &QueryResult) {
    if let Some(msg) = &result.message {
        println!("{}", msg);
    } else if !result.columns.is_empty() {
        print!("{}", format_results(&result.columns, &result.rows));
    } else {
        println!("{} row(s) affected", result.affected_rows);
    }
}

/// Exit code for a failed statement
fn exit_code(err: &Error) -> i32 {
    match err.kind() {
        ErrorKind::CorruptPage => EXIT_CORRUPT,
        ErrorKind::Cancelled => EXIT_CANCELLED,
        _ => EXIT_STATEMENT,
    }
}

/// Split a script into statements on `;` outside string literals.
fn split_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut in_string = false;
    for c in script.chars() {
        match c {
            '\'' => {
                in_string = !in_string;
                current.push(c);
            }
            ';' if !in_string => {
                if !current.trim().is_empty() {
                    statements.push(current.trim().to_string());
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        statements.push(current.trim().to_string());
    }
    statements
}

/// An open database plus the explicit transaction, if one is running
struct Session {
    engine: Engine,
    tx: Option<Transaction>,
}

impl Session {
    fn execute_sql(&mut self, sql: &str) -> emberdb::Result<()> {
        let stmt = parse_statement(sql)?;
        match stmt {
            Statement::Begin(isolation) => {
                if self.tx.is_some() {
                    return Err(Error::InvalidArgument(
                        "a transaction is already in progress".to_string(),
                    ));
                }
                let isolation = isolation.unwrap_or(self.engine.options().default_isolation);
                self.tx = Some(self.engine.begin(isolation)?);
                println!("BEGIN");
            }
            Statement::Commit => match self.tx.take() {
                Some(tx) => {
                    tx.commit()?;
                    println!("COMMIT");
                }
                None => println!("no transaction in progress"),
            },
            Statement::Rollback => match self.tx.take() {
                Some(tx) => {
                    tx.abort()?;
                    println!("ROLLBACK");
                }
                None => println!("no transaction in progress"),
            },
            stmt => match self.tx.as_mut() {
                Some(tx) => {
                    let result = tx.query_statement(stmt);
                    if tx.state() == TransactionState::Aborted {
                        self.tx = None;
                        eprintln!("transaction aborted");
                    }
                    print_result(&result?);
                }
                None => print_result(&self.engine.query_statement(stmt)?),
            },
        }
        Ok(())
    }

    /// Handle a dot command; `Ok(false)` asks the caller to quit.
    fn handle_special_command(&mut self, cmd: &str) -> emberdb::Result<bool> {
        let parts: Vec<&str> = cmd.split_whitespace().collect();
        let catalog = self.engine.catalog();

        match parts.first().copied() {
            Some(".help") => print_help(),
            Some(".quit") | Some(".exit") => return Ok(false),
            Some(".tables") => {
                let tables = catalog.list_tables();
                if tables.is_empty() {
                    println!("No tables found.");
                } else {
                    println!("Tables:");
                    for table in tables {
                        println!("  {}", table);
                    }
                }
            }
            Some(".schema") => match parts.get(1) {
                Some(table_name) => println!("{}", catalog.get_table_info(table_name)?),
                None => {
                    for table_name in catalog.list_tables() {
                        println!("{}", catalog.get_table_info(&table_name)?);
                    }
                }
            },
            Some(".indexes") => {
                let listing = format_indexes(catalog, parts.get(1).copied())?;
                if listing.is_empty() {
                    println!("No indexes found.");
                } else {
                    print!("{}", listing);
                }
            }
            Some(".check") => {
                let report = self.engine.check_integrity()?;
                if report.is_ok() {
                    println!(
                        "ok: {} tables, {} pages",
                        report.tables_checked, report.pages_checked
                    );
                } else {
                    for (table_id, page_id) in &report.corrupt_pages {
                        println!("corrupt page {} in table {}", page_id, table_id);
                    }
                    for problem in report
                        .index_errors
                        .iter()
                        .chain(&report.orphan_entries)
                        .chain(&report.unindexed_rows)
                    {
                        println!("{}", problem);
                    }
                    return Err(Error::CorruptPage {
                        table_id: report.corrupt_pages.first().map(|p| p.0).unwrap_or(0),
                        page_id: report.corrupt_pages.first().map(|p| p.1).unwrap_or(0),
                    });
                }
            }
            Some(".vacuum") => {
                let stats = self.engine.vacuum(parts.get(1).copied())?;
                println!(
                    "{} rows, {} versions, {} index entries removed; {} pages released",
                    stats.rows_removed,
                    stats.versions_removed,
                    stats.index_entries_removed,
                    stats.pages_released
                );
            }
            Some(".analyze") => {
                self.engine.analyze(parts.get(1).copied())?;
                println!("ok");
            }
            Some(cmd) => {
                eprintln!("Unknown command: {}", cmd);
                eprintln!("Type '.help' for available commands.");
            }
            None => {}
        }
        Ok(true)
    }

    /// Run one command or statement, reporting errors. Returns the exit
    /// code it would warrant and whether to keep going.
    fn run_line(&mut self, line: &str) -> (i32, bool) {
        let outcome = if line.starts_with('.') {
            self.handle_special_command(line)
        } else {
            self.execute_sql(line).map(|_| true)
        };
        match outcome {
            Ok(proceed) => (EXIT_OK, proceed),
            Err(e) => {
                eprintln!("Error [{}]: {}", e.kind(), e);
                (exit_code(&e), true)
            }
        }
    }

    /// Run statements in order, stopping at the first failure.
    fn run_script(&mut self, script: &str) -> i32 {
        for statement in split_statements(script) {
            let (code, proceed) = self.run_line(&statement);
            if code != EXIT_OK {
                return code;
            }
            if !proceed {
                break;
            }
        }
        EXIT_OK
    }

    fn run_repl(&mut self) -> anyhow::Result<i32> {
        let mut editor = DefaultEditor::new()?;
        let history = env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join(HISTORY_FILE));
        if let Some(path) = &history {
            // missing on first run
            let _ = editor.load_history(path);
        }

        print_banner();

        let mut input_buffer = String::new();
        loop {
            let prompt = if input_buffer.is_empty() { "emberdb> " } else { "   ...> " };
            let line = match editor.readline(prompt) {
                Ok(line) => line,
                Err(ReadlineError::Interrupted) => {
                    input_buffer.clear();
                    continue;
                }
                Err(ReadlineError::Eof) => break,
                Err(e) => return Err(e.into()),
            };
            let trimmed = line.trim();

            if input_buffer.is_empty() && trimmed.starts_with('.') {
                editor.add_history_entry(trimmed)?;
                if !self.run_line(trimmed).1 {
                    break;
                }
                continue;
            }
            if trimmed.is_empty() {
                continue;
            }

            input_buffer.push_str(&line);
            input_buffer.push('\n');
            if trimmed.ends_with(';') {
                let sql = std::mem::take(&mut input_buffer);
                editor.add_history_entry(sql.trim())?;
                for statement in split_statements(&sql) {
                    self.run_line(&statement);
                }
            }
        }

        if let Some(path) = &history {
            if let Err(e) = editor.save_history(path) {
                tracing::warn!(error = %e, "could not save history");
            }
        }
        println!("Goodbye!");
        Ok(EXIT_OK)
    }
}

enum Input {
    Interactive,
    Command(String),
    File(PathBuf),
}

struct Args {
    dir: PathBuf,
    options: Options,
    input: Input,
}

fn flag_value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> anyhow::Result<&'a str> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("{} needs a value", flag))
}

fn parse_args(args: &[String]) -> anyhow::Result<Args> {
    let mut options = Options::default();
    let mut dir = None;
    let mut input = Input::Interactive;
    let mut i = 0;
    while i < args.len() {
        let arg = args[i].as_str();
        match arg {
            "--page-size" => {
                let v = flag_value(args, &mut i, arg)?;
                options.page_size = v.parse().with_context(|| format!("bad page size '{}'", v))?;
            }
            "--pool-pages" => {
                let v = flag_value(args, &mut i, arg)?;
                options.buffer_pool_pages = v.parse().with_context(|| format!("bad pool size '{}'", v))?;
            }
            "--sync" => {
                options.wal_sync_mode = flag_value(args, &mut i, arg)?.parse()?;
            }
            "--lock-timeout-ms" => {
                let v = flag_value(args, &mut i, arg)?;
                let ms: u64 = v.parse().with_context(|| format!("bad lock timeout '{}'", v))?;
                options.lock_timeout = Duration::from_millis(ms);
            }
            "-c" => input = Input::Command(flag_value(args, &mut i, arg)?.to_string()),
            "-f" => input = Input::File(PathBuf::from(flag_value(args, &mut i, arg)?)),
            "-h" | "--help" => bail!("help requested"),
            other if other.starts_with('-') => bail!("unknown option '{}'", other),
            other => {
                if dir.replace(PathBuf::from(other)).is_some() {
                    bail!("more than one database directory given");
                }
            }
        }
        i += 1;
    }
    let dir = dir.ok_or_else(|| anyhow!("missing database directory"))?;
    Ok(Args { dir, options, input })
}

fn run() -> anyhow::Result<i32> {
    let args: Vec<String> = env::args().skip(1).collect();
    let args = match parse_args(&args) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {}", e);
            print_usage();
            return Ok(EXIT_USAGE);
        }
    };
    let script = match &args.input {
        Input::File(path) => Some(
            fs::read_to_string(path).with_context(|| format!("cannot read '{}'", path.display()))?,
        ),
        _ => None,
    };

    let engine = match Engine::open(&args.dir, args.options) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Error [{}]: cannot open '{}': {}", e.kind(), args.dir.display(), e);
            return Ok(match e.kind() {
                ErrorKind::CorruptPage => EXIT_CORRUPT,
                ErrorKind::InvalidArgument => EXIT_USAGE,
                _ => EXIT_STATEMENT,
            });
        }
    };
    let mut session = Session { engine, tx: None };

    match args.input {
        Input::Interactive => session.run_repl(),
        Input::Command(sql) => Ok(session.run_script(&sql)),
        Input::File(_) => Ok(session.run_script(script.as_deref().unwrap_or_default())),
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("EMBERDB_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            EXIT_USAGE
        }
    };
    process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_split_statements_respects_strings() {
        let parts = split_statements("INSERT INTO t VALUES ('a;b'); SELECT * FROM t;\n");
        assert_eq!(parts, vec!["INSERT INTO t VALUES ('a;b')", "SELECT * FROM t"]);
    }

    #[test]
    fn test_parse_args() {
        let parsed = parse_args(&args(&["--page-size", "4096", "--sync", "full", "db", "-c", "SELECT 1"])).unwrap();
        assert_eq!(parsed.dir, PathBuf::from("db"));
        assert_eq!(parsed.options.page_size, 4096);
        assert_eq!(parsed.options.wal_sync_mode, emberdb::WalSyncMode::Full);
        assert!(matches!(parsed.input, Input::Command(ref sql) if sql == "SELECT 1"));

        assert!(parse_args(&args(&[])).is_err());
        assert!(parse_args(&args(&["--bogus", "db"])).is_err());
        assert!(parse_args(&args(&["db", "--pool-pages"])).is_err());
    }

    #[test]
    fn test_format_indexes() {
        let catalog = Catalog::new();
        assert_eq!(format_indexes(&catalog, None).unwrap(), "");
        let users = emberdb::catalog::TableBuilder::new("users")
            .primary_key("id", emberdb::DataType::Int32)
            .column("name", emberdb::DataType::Varchar)
            .build()
            .unwrap();
        catalog.create_table(users).unwrap();
        catalog
            .add_index("users", emberdb::catalog::IndexDef::new("idx_name", vec![1]).unique(true))
            .unwrap();
        assert_eq!(
            format_indexes(&catalog, None).unwrap(),
            "  users.users_pkey (id) PRIMARY\n  users.idx_name (name) UNIQUE\n"
        );
        catalog.drop_index("idx_name").unwrap();
        assert_eq!(
            format_indexes(&catalog, Some("USERS")).unwrap(),
            "  users.users_pkey (id) PRIMARY\n"
        );
        assert!(format_indexes(&catalog, Some("nope")).is_err());
    }

    #[test]
    fn test_format_results() {
        let rows = vec![Tuple::new(vec![emberdb::Value::Int32(1), emberdb::Value::Varchar("Alice".into())])];
        let out = format_results(&["id".to_string(), "name".to_string()], &rows);
        assert!(out.contains("| id | name  |"));
        assert!(out.contains("|  1 | Alice |"));
        assert!(out.ends_with("1 row(s) returned\n"));
    }
}
