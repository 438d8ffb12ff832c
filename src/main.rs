use clap::{crate_version, App, Arg};
use h2client::{Client, Request, Url};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let matches = App::new("h2client")
        .version(crate_version!())
        .arg(Arg::with_name("url").required(true).index(1))
        .get_matches();
    let url = Url::parse(matches.value_of("url").expect("missing url"))?;

    let client = Client::default();
    let response = client.request(Request::get(url)).await?;
    eprintln!("{}", response.status());
    println!("{}", response.text());
    Ok(())
}
