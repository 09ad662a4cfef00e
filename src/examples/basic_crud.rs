//! Create, read, update, and delete a single document.

use tidemark_client::{Auth, ClientConfig, DatabaseClient, StringHandle, WriteOptions};

#[tokio::main]
async fn main() -> tidemark_client::Result<()> {
    let config = ClientConfig::new("localhost", 8002);
    let auth = Auth::Digest {
        username: "rest-writer".to_string(),
        password: "secret".to_string(),
    };
    let client = DatabaseClient::connect(config, auth)?;
    client.ping().await?;

    // Create with a server-assigned URI.
    let draft = StringHandle::json(r#"{"status": "draft"}"#);
    let mut desc = client
        .create_document(&draft, None, &WriteOptions::default(), None)
        .await?;
    println!("created {}", desc.uri);

    let body: String = client.read_document(&mut desc, None).await?;
    println!("read {} bytes, version {:?}", body.len(), desc.version);

    // The version token captured by the read makes this update conditional.
    let published = StringHandle::json(r#"{"status": "published"}"#);
    client
        .write_document(&mut desc, &published, None, &WriteOptions::default(), None)
        .await?;
    println!("updated to version {:?}", desc.version);

    client
        .delete_document(&desc, &WriteOptions::default(), None)
        .await?;
    println!("deleted {}", desc.uri);

    client.release();
    Ok(())
}
