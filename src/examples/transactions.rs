//! Move value between two documents atomically inside a server transaction.

use tidemark_client::{
    Auth, ClientConfig, DatabaseClient, DocumentDescriptor, StringHandle, Transaction,
    WriteOptions,
};

#[tokio::main]
async fn main() -> tidemark_client::Result<()> {
    let config = ClientConfig::new("localhost", 8002);
    let auth = Auth::Digest {
        username: "rest-writer".to_string(),
        password: "secret".to_string(),
    };
    let client = DatabaseClient::connect(config, auth)?;

    let tx = client.open_transaction(Some("transfer"), Some(120)).await?;
    println!("opened transaction {}", tx.id());

    match transfer(&client, &tx).await {
        Ok(()) => {
            tx.commit().await?;
            println!("committed");
        }
        Err(e) => {
            eprintln!("transfer failed: {e}");
            tx.rollback().await?;
        }
    }

    client.release();
    Ok(())
}

async fn transfer(client: &DatabaseClient, tx: &Transaction) -> tidemark_client::Result<()> {
    let mut from = DocumentDescriptor::new("/accounts/a.json");
    let mut to = DocumentDescriptor::new("/accounts/b.json");

    let debit = StringHandle::json(r#"{"balance": 40}"#);
    let credit = StringHandle::json(r#"{"balance": 60}"#);

    client
        .write_document(&mut from, &debit, None, &WriteOptions::default(), Some(tx))
        .await?;
    client
        .write_document(&mut to, &credit, None, &WriteOptions::default(), Some(tx))
        .await?;
    Ok(())
}
