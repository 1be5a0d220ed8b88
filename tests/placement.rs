mod support;

use rustfs::protocol::{Request, Response};
use rustfs::wire::{receive_message, send_message};
use support::{start_chunk_server, start_master, test_config};
use tokio::net::TcpStream;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn get_chunk_servers_ranks_by_distance_to_the_requesting_client() {
    let metadata_dir = tempfile::tempdir().unwrap();
    let master_addr = start_master(test_config(metadata_dir.path(), 64, 1)).await;

    let data_dir = tempfile::tempdir().unwrap();
    let near = start_chunk_server("near", &data_dir.path().join("near"), (0.0, 0.0), &master_addr, 1).await;
    let far = start_chunk_server("far", &data_dir.path().join("far"), (100.0, 100.0), &master_addr, 1).await;

    register_client(&master_addr, "at-origin", (0.0, 0.0)).await;
    register_client(&master_addr, "at-far", (99.0, 99.0)).await;

    let servers = get_ranked_servers(&master_addr, "at-origin").await;
    assert_eq!(servers[0], near);

    let servers = get_ranked_servers(&master_addr, "at-far").await;
    assert_eq!(servers[0], far);
}

async fn register_client(master_addr: &str, client_id: &str, location: (f64, f64)) {
    let mut conn = TcpStream::connect(master_addr).await.unwrap();
    send_message(
        &mut conn,
        &Request::RegisterClient {
            client_id: client_id.to_string(),
            location,
        },
    )
    .await
    .unwrap();
    let _: Option<Response> = receive_message(&mut conn).await.unwrap();
}

async fn get_ranked_servers(master_addr: &str, client_id: &str) -> Vec<String> {
    let mut conn = TcpStream::connect(master_addr).await.unwrap();
    send_message(
        &mut conn,
        &Request::GetChunkServers {
            client_id: Some(client_id.to_string()),
        },
    )
    .await
    .unwrap();
    let response: Response = receive_message(&mut conn).await.unwrap().unwrap();
    response.servers.unwrap()
}
