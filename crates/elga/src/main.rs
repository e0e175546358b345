//! The elga binary.
//!
//! Hosts every ElGA component behind one executable: the directory
//! master, directory servers, agents, streamers, and the client. Agents
//! and directories run one instance per local number, each on its own
//! thread.

use elga_api::{Address, AlgorithmKind, ElgaError, ElgaResult, MsgKind, Tunables};
use elga_core::{agent, Client, Directory, DirectoryMaster, ProcessCtx, Streamer};

#[derive(clap::Parser, Debug)]
#[command(name = "elga", version, about = "An elastic graph processing system")]
struct Args {
    /// IP address of the directory master.
    #[arg(short = 'd', long = "directory-master")]
    directory_master: String,

    /// Local number base, for running multiple elga processes per host.
    #[arg(short = 'B', long = "base", default_value_t = 0)]
    base: u16,

    /// Number of worker threads for agents and directories.
    ///
    /// Defaults to one per CPU for agents and directories, and one for
    /// everything else.
    #[arg(short = 'P', long = "procs")]
    procs: Option<u16>,

    /// Output tracing in json format.
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug, Clone)]
enum Command {
    /// Run the cluster rendezvous. This runs once per cluster and its IP
    /// is given to all other components with -d.
    DirectoryMaster,

    /// Run a directory server managing the elastic agent membership.
    Directory {
        /// The IP address to listen on.
        ip: String,
    },

    /// Run agents maintaining the graph and executing the algorithm.
    Agent {
        /// The IP address to listen on.
        ip: String,
    },

    /// Stream edge changes into the cluster.
    ///
    /// Sources are processed in order: file paths are parsed as edge
    /// lists; `rg N M r P` generates M/P random edges over N vertices
    /// from rank r; `listen ADDR` drains batches off the network.
    /// Modifiers: +el / +no+el switch the line format, +batch /
    /// +no+batch toggle batching, +wait+batch waits for batch results,
    /// +mb N sets the mini-batch size.
    Streamer {
        /// Sources and modifiers, processed left to right.
        #[arg(required = true)]
        sources: Vec<String>,
    },

    /// Query the cluster.
    Client {
        #[command(subcommand)]
        query: ClientQuery,
    },
}

#[derive(clap::Subcommand, Debug, Clone)]
enum ClientQuery {
    /// Shut the whole system down gracefully.
    Shutdown,
    /// List all directory servers.
    Directories,
    /// Trigger entering the batch state without processing.
    Update,
    /// Start the computation, optionally from a start vertex.
    Start {
        /// The start vertex (algorithms that use one).
        vertex: Option<u64>,
    },
    /// Save the computation results to disk.
    Save,
    /// Dump the current graph to disk.
    Dump,
    /// Reset algorithm outputs.
    Reset,
    /// Trigger a sketch-based load balancing round.
    Lb,
    /// Confirm the transpose of the stored graph.
    CheckTranspose,
    /// Rebalance virtual agent counts.
    Va,
    /// Query a single vertex result.
    Query {
        /// The vertex to query.
        vertex: u64,
    },
    /// Run the paced query workload.
    Workload,
}

fn main() {
    let args = <Args as clap::Parser>::parse();

    let t = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .with_file(true)
        .with_line_number(true);
    if args.json {
        t.json().try_init()
    } else {
        t.try_init()
    }
    .expect("failed to init tracing");

    match run(args) {
        Ok(()) => {}
        Err(ElgaError::Arg(msg)) => {
            eprintln!("Argument error: {msg}");
            eprintln!("Usage: elga [-h] [-v] -d <dir-master-ip> [-B base] [-P procs] <command> [args...]");
            std::process::exit(2);
        }
        Err(e) => {
            eprintln!("Fatal: {e}");
            std::process::exit(1);
        }
    }
}

fn run(args: Args) -> ElgaResult<()> {
    let tunables = Tunables::from_env()?;

    // Only agents and directories scale across cores by default.
    let multi = matches!(args.command, Command::Agent { .. } | Command::Directory { .. });
    let threads = match args.procs {
        Some(p) if p > 0 => p,
        Some(_) => return Err(ElgaError::arg("-P must be positive")),
        None if multi => num_cpus::get() as u16,
        None => 1,
    };

    let local_base = args.base;
    let local_max = local_base
        .checked_add(threads)
        .ok_or_else(|| ElgaError::arg("num procs with base too large"))?;

    let ctx = ProcessCtx::new(tunables, local_base, local_max);

    {
        let ctx = ctx.clone();
        ctrlc::set_handler(move || {
            eprintln!("Ctrl+C caught. Shutting down...");
            ctx.request_shutdown();
        })
        .map_err(|e| ElgaError::other(format!("cannot install signal handler: {e}")))?;
    }

    // The -d address is the directory master's endpoint at local 0.
    let dm = Address::parse(&args.directory_master, 0)?;

    let mut workers = Vec::new();
    for ln in local_base..local_max {
        let ctx = ctx.clone();
        let command = args.command.clone();
        workers.push(std::thread::spawn(move || worker(ctx, ln, command, dm)));
    }

    let mut result = Ok(());
    for w in workers {
        match w.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => result = Err(e),
            Err(_) => result = Err(ElgaError::other("worker thread panicked")),
        }
    }
    result
}

fn worker(ctx: ProcessCtx, ln: u16, command: Command, dm: Address) -> ElgaResult<()> {
    match command {
        Command::DirectoryMaster => {
            if ln != ctx.local_base {
                return Ok(());
            }
            let mut m = DirectoryMaster::new(&ctx, dm)?;
            m.run()
        }
        Command::Directory { ip } => {
            let addr = Address::parse(&ip, ln)?;
            let mut d = Directory::new(&ctx, addr, dm)?;
            d.join_directory()?;
            d.join_peers()?;
            d.run()
        }
        Command::Agent { ip } => {
            let addr = Address::parse(&ip, ln)?;
            agent::run_configured(&ctx, addr, dm)
        }
        Command::Streamer { sources } => {
            if ln != ctx.local_base {
                return Ok(());
            }
            run_streamer(&ctx, dm, &sources)
        }
        Command::Client { query } => {
            if ln != ctx.local_base {
                return Ok(());
            }
            run_client(&ctx, dm, query)
        }
    }
}

fn run_streamer(ctx: &ProcessCtx, dm: Address, sources: &[String]) -> ElgaResult<()> {
    let mut s = Streamer::new(ctx, dm)?;
    s.wait_until_ready()?;

    let mut el = false;
    let mut it = sources.iter();
    while let Some(src) = it.next() {
        let start = std::time::Instant::now();
        match src.as_str() {
            "+el" => el = true,
            "+no+el" => el = false,
            "+batch" => s.set_batch(true),
            "+no+batch" => s.set_batch(false),
            "+wait+batch" => s.wait_batch()?,
            "+mb" => {
                let n = it
                    .next()
                    .ok_or_else(|| ElgaError::arg("+mb expects a size"))?
                    .parse()
                    .map_err(|_| ElgaError::arg("+mb expects a number"))?;
                s.set_mb(n);
            }
            "rg" => {
                let mut num = || -> ElgaResult<u64> {
                    it.next()
                        .ok_or_else(|| ElgaError::arg("rg expects N M r P"))?
                        .parse()
                        .map_err(|_| ElgaError::arg("rg expects numbers"))
                };
                let n = num()?;
                let m = num()?;
                let r = num()? as u32;
                let p = num()? as u32;
                tracing::info!(n, m, r, p, "random graph");
                s.rg(n, m, r, p)?;
            }
            "listen" => {
                let addr = it
                    .next()
                    .ok_or_else(|| ElgaError::arg("listen expects an address"))?;
                s.listen(addr)?;
            }
            fname => s.parse_file(fname, el)?,
        }
        tracing::info!(source = %src, elapsed = ?start.elapsed(), "source done");
    }
    tracing::info!("streamer end");
    Ok(())
}

fn run_client(ctx: &ProcessCtx, dm: Address, query: ClientQuery) -> ElgaResult<()> {
    let mut c = Client::new(ctx, dm)?;
    match query {
        ClientQuery::Shutdown => c.query(MsgKind::Shutdown),
        ClientQuery::Directories => {
            for addr in c.query_directories()? {
                println!("{addr}");
            }
            Ok(())
        }
        ClientQuery::Update => c.query(MsgKind::Update),
        ClientQuery::Start { vertex: Some(v) } => c.start_vtx(v),
        ClientQuery::Start { vertex: None } => c.query(MsgKind::Start),
        ClientQuery::Save => c.query(MsgKind::Save),
        ClientQuery::Dump => c.query(MsgKind::Dump),
        ClientQuery::Reset => c.query(MsgKind::Reset),
        ClientQuery::Lb => c.query(MsgKind::CsLb),
        ClientQuery::CheckTranspose => c.query(MsgKind::ChkT),
        ClientQuery::Va => c.query(MsgKind::Va),
        ClientQuery::Query { vertex } => {
            let resp = c.query_vertex(vertex)?;
            print_result(&ctx.tunables, vertex, &resp);
            Ok(())
        }
        ClientQuery::Workload => c.workload(),
    }
}

fn print_result(t: &Tunables, vertex: u64, resp: &[u8]) {
    if resp.len() != 8 {
        println!("{vertex} ?");
        return;
    }
    let raw: [u8; 8] = resp.try_into().expect("len 8");
    match t.algorithm {
        AlgorithmKind::Pagerank => {
            println!("{vertex} {}", f64::from_le_bytes(raw));
        }
        _ => {
            println!("{vertex} {}", u64::from_le_bytes(raw));
        }
    }
}
