use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use shmkv::{Pool, PoolError, PoolOptions, Result};
use std::time::Duration;

fn main() {
    env_logger::init();

    let matches = Command::new("shmkv-cli")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Inspect and maintain shmkv shared memory pools")
        .arg(
            Arg::new("namespace")
                .short('n')
                .long("namespace")
                .value_name("NAMESPACE")
                .help("Pool namespace, resolved under SHMKV_NAMESPACES_ROOT_PATH")
                .global(true),
        )
        .arg(
            Arg::new("file")
                .short('f')
                .long("file")
                .value_name("PATH")
                .help("Explicit pool file path")
                .global(true),
        )
        .arg(
            Arg::new("size_mb")
                .short('s')
                .long("size-mb")
                .value_name("MIB")
                .help("Pool size in MiB when the pool is created (0 = default)")
                .value_parser(value_parser!(f64))
                .default_value("0")
                .global(true),
        )
        .arg(
            Arg::new("min_alloc_size")
                .long("min-alloc-size")
                .value_name("BYTES")
                .help("Minimum allocation size when the pool is created")
                .value_parser(value_parser!(u64))
                .default_value("64")
                .global(true),
        )
        .arg(
            Arg::new("lock_timeout_ms")
                .long("lock-timeout-ms")
                .value_name("MS")
                .help("Wait on the pool lock before probing its holder")
                .value_parser(value_parser!(u64))
                .default_value("2000")
                .global(true),
        )
        .subcommand_required(true)
        .subcommand(Command::new("status").about("Show memory usage"))
        .subcommand(
            Command::new("get")
                .about("Print the value stored under a key")
                .arg(Arg::new("key").required(true)),
        )
        .subcommand(
            Command::new("set")
                .about("Store a value under a key")
                .arg(Arg::new("key").required(true))
                .arg(Arg::new("value").required(true)),
        )
        .subcommand(
            Command::new("delete")
                .about("Remove a key")
                .arg(Arg::new("key").required(true)),
        )
        .subcommand(Command::new("clear").about("Remove every key"))
        .subcommand(Command::new("keys").about("List every key"))
        .subcommand(Command::new("check").about("Repair the pool and report its consistency"))
        .subcommand(
            Command::new("drop")
                .about("Delete the pool file")
                .arg(
                    Arg::new("force")
                        .long("force")
                        .help("Remove even if another process holds the lock")
                        .action(ArgAction::SetTrue),
                ),
        )
        .get_matches();

    if let Err(e) = run(&matches) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn pool_options(matches: &ArgMatches) -> Result<PoolOptions> {
    let options = match (
        matches.get_one::<String>("namespace"),
        matches.get_one::<String>("file"),
    ) {
        (Some(namespace), None) => PoolOptions::namespace(namespace.as_str()),
        (None, Some(file)) => PoolOptions::filename(file.as_str()),
        _ => {
            return Err(PoolError::invalid_argument(
                "pool",
                "Exactly one of --namespace and --file is required",
            ))
        }
    };

    let size_mb = matches.get_one::<f64>("size_mb").copied().unwrap_or(0.0);
    let min_alloc_size = matches.get_one::<u64>("min_alloc_size").copied().unwrap_or(64);
    let timeout_ms = matches.get_one::<u64>("lock_timeout_ms").copied().unwrap_or(2000);

    Ok(options
        .with_size_mb(size_mb)
        .with_min_alloc_size(min_alloc_size)
        .with_lock_timeout(Duration::from_millis(timeout_ms)))
}

fn arg<'a>(matches: &'a ArgMatches, name: &str) -> Result<&'a str> {
    matches
        .get_one::<String>(name)
        .map(String::as_str)
        .ok_or_else(|| PoolError::invalid_argument(name, "Missing argument"))
}

fn run(matches: &ArgMatches) -> Result<()> {
    let Some((command, sub)) = matches.subcommand() else {
        println!("Use --help for usage information");
        return Ok(());
    };
    // Global options are propagated into the subcommand's matches
    let options = pool_options(sub)?;

    match command {
        "drop" => {
            let force = sub.get_flag("force");
            Pool::drop_pool(&options, force)?;
            println!("Dropped {}", options.path()?.display());
            Ok(())
        }
        "check" => {
            let consistent = Pool::check(options)?;
            println!("{}", if consistent { "consistent" } else { "INCONSISTENT" });
            if !consistent {
                std::process::exit(2);
            }
            Ok(())
        }
        _ => {
            let mut pool = Pool::create_or_open(options)?;
            let result = handle_pool_command(&pool, command, sub);
            pool.close()?;
            result
        }
    }
}

fn handle_pool_command(pool: &Pool, command: &str, matches: &ArgMatches) -> Result<()> {
    match command {
        "status" => {
            println!("Pool: {}", pool.path().display());
            println!("{}", pool.status()?);
            println!("entries:       {}", pool.size()?);
        }
        "get" => {
            let key = arg(matches, "key")?;
            match pool.get(key.as_bytes())? {
                Some(value) => println!("{}", String::from_utf8_lossy(&value)),
                None => {
                    eprintln!("Key not found: {}", key);
                    std::process::exit(3);
                }
            }
        }
        "set" => {
            pool.set(arg(matches, "key")?.as_bytes(), arg(matches, "value")?.as_bytes())?;
        }
        "delete" => {
            let key = arg(matches, "key")?;
            if !pool.delete(key.as_bytes())? {
                println!("Key not found: {}", key);
            }
        }
        "clear" => pool.clear()?,
        "keys" => {
            for key in pool.keys()? {
                println!("{}", String::from_utf8_lossy(&key));
            }
        }
        other => println!("Unknown command '{}', use --help for usage information", other),
    }
    Ok(())
}
