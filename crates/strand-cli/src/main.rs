use clap::Parser;
use strand_cli::config::{Cli, Command};
use strand_cli::{Message, Store, render};
use strand_logging::{LogConfig, StrandSubscriberBuilder};
use strand_storage::{SubsetOptions, gt, limit, lt, reverse};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _guard = StrandSubscriberBuilder::new()
        .with_config(LogConfig::cli())
        .with_level(&cli.log_level)
        .init();

    let store = Store::open(&cli.dir).await?;
    let result = run(&store, cli.command).await;
    store.close().await?;
    result
}

async fn run(store: &Store, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Append {
            author,
            kind,
            content,
        } => {
            let seq = store.append(Message::new(author, kind, &content)).await?;
            println!("{seq}");
        }

        Command::Get { seq } => {
            let msg = store.get(seq).await?;
            println!("{}", serde_json::to_string(&msg)?);
        }

        Command::Query {
            gt: after,
            lt: before,
            limit: max,
            reverse: newest_first,
        } => {
            let mut specs = Vec::new();
            if let Some(seq) = after {
                specs.push(gt(seq));
            }
            if let Some(seq) = before {
                specs.push(lt(seq));
            }
            if let Some(n) = max {
                specs.push(limit(n));
            }
            specs.push(reverse(newest_first));

            for item in store.query(specs).await? {
                println!("{}", render(&item)?);
            }
        }

        Command::Tail { all } => {
            let token = CancellationToken::new();
            let stop = token.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    stop.cancel();
                }
            });

            store
                .tail(all, &token, |item| {
                    println!("{}", render(item)?);
                    Ok(())
                })
                .await?;
        }

        Command::Null { seq } => {
            store.null(seq).await?;
            println!("nulled {seq}");
        }

        Command::IndexSeq => {
            for (name, seq) in store.index_seqs()? {
                println!("{name}\t{seq}");
            }
        }

        Command::Subset {
            query,
            descending,
            limit: page_limit,
        } => {
            let opts = SubsetOptions {
                descending,
                page_limit,
            };
            for msg in store.subset(&query, &opts).await? {
                println!("{}", serde_json::to_string(&msg)?);
            }
        }
    }

    Ok(())
}
