use std::{env, process};

use f4sten::{LoaderError, Outcome, builtin_registry, launch};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    dotenvy::dotenv().ok();

    let registry = match builtin_registry() {
        Ok(registry) => registry,
        Err(err) => fail(err),
    };

    match launch(&registry, env::args()).await {
        Ok(Outcome::Completed) => {}
        Ok(Outcome::Listed(text)) | Ok(Outcome::Schema(text)) => println!("{text}"),
        Err(err) if err.is_informational() => println!("{err}"),
        Err(err) => fail(err),
    }
}

fn fail(err: LoaderError) -> ! {
    eprintln!("error: {err}");
    process::exit(err.exit_code());
}
