use sha1::{Digest, Sha1};
use tokio::io::DuplexStream;
use torrent_wire::{
    Bitfield, BlockInfo, DEFAULT_PORT, Frame, Handshake, Message, MessageId, MetaInfo, PeerId,
    decode_compact, exchange_handshake, read_message, write_keep_alive, write_message,
};

const DATA: &[u8; 20] = b"0123456789abcdefWXYZ";
const PIECE_LENGTH: usize = 16;

fn torrent_bytes() -> Vec<u8> {
    let mut pieces = Vec::new();
    for piece in DATA.chunks(PIECE_LENGTH) {
        pieces.extend_from_slice(&Sha1::digest(piece));
    }

    let mut bytes = b"d8:announce30:http://127.0.0.1:8080/announce4:info".to_vec();
    bytes.extend_from_slice(b"d6:lengthi20e4:name4:demo12:piece lengthi16e6:pieces40:");
    bytes.extend_from_slice(&pieces);
    bytes.extend_from_slice(b"ee");
    bytes
}

fn peer_id(tag: u8) -> PeerId {
    let mut id = *b"-TW0100-000000000000";
    id[19] = tag;
    id
}

async fn next_message(stream: &mut DuplexStream) -> Message {
    loop {
        match read_message(stream).await.unwrap() {
            Frame::KeepAlive => continue,
            Frame::Message(message) => return message,
        }
    }
}

async fn seed(mut stream: DuplexStream, metainfo: MetaInfo) -> u32 {
    let ours = Handshake::new(metainfo.info_hash, peer_id(b's'));
    exchange_handshake(&mut stream, &ours).await.unwrap();

    let mut have = Bitfield::new(metainfo.num_pieces());
    for index in 0..metainfo.num_pieces() {
        have.set_piece(index).unwrap();
    }
    write_message(&mut stream, &Message::bitfield(&have))
        .await
        .unwrap();

    let interested = next_message(&mut stream).await;
    assert_eq!(interested.id(), Some(MessageId::Interested));
    write_keep_alive(&mut stream).await.unwrap();
    write_message(&mut stream, &Message::unchoke()).await.unwrap();

    let request = next_message(&mut stream).await.parse_request().unwrap();
    let range = metainfo.piece_bounds(request.piece_index as usize).unwrap();
    let begin = range.start as usize + request.begin as usize;
    let block = &DATA[begin..begin + request.length as usize];
    write_message(
        &mut stream,
        &Message::piece(request.piece_index, request.begin, block),
    )
    .await
    .unwrap();

    next_message(&mut stream).await.parse_have().unwrap()
}

#[tokio::test]
async fn test_download_one_piece_from_a_peer() {
    let metainfo = MetaInfo::from_bytes(&torrent_bytes()).unwrap();
    assert_eq!(metainfo.num_pieces(), 2);

    let url = metainfo.tracker_url(peer_id(b'l'), DEFAULT_PORT);
    assert!(url.query().unwrap().contains("compact=1"));
    let peers = decode_compact(&[127, 0, 0, 1, 0x1A, 0xE1]).unwrap();
    assert_eq!(peers[0].to_string(), "127.0.0.1:6881");

    let (mut stream, remote) = tokio::io::duplex(1024);
    let seeder = tokio::spawn(seed(remote, metainfo.clone()));

    let ours = Handshake::new(metainfo.info_hash, peer_id(b'l'));
    let theirs = exchange_handshake(&mut stream, &ours).await.unwrap();
    assert_eq!(theirs.peer_id, peer_id(b's'));

    let peer_has = next_message(&mut stream)
        .await
        .parse_bitfield(metainfo.num_pieces())
        .unwrap();
    assert!(peer_has.has_piece(1).unwrap());

    write_message(&mut stream, &Message::interested()).await.unwrap();
    assert_eq!(
        next_message(&mut stream).await.id(),
        Some(MessageId::Unchoke)
    );

    // The last piece is the short one.
    let piece_size = metainfo.piece_size(1).unwrap() as u32;
    assert_eq!(piece_size, 4);
    let block = BlockInfo {
        piece_index: 1,
        begin: 0,
        length: piece_size,
    };
    write_message(&mut stream, &Message::request(block))
        .await
        .unwrap();

    let mut buf = vec![0u8; piece_size as usize];
    let copied = next_message(&mut stream)
        .await
        .parse_piece(1, &mut buf)
        .unwrap();
    assert_eq!(copied, 4);
    assert_eq!(buf, b"WXYZ");
    metainfo.verify_piece(1, &buf).unwrap();

    let mut ours_have = Bitfield::new(metainfo.num_pieces());
    ours_have.set_piece(1).unwrap();
    assert_eq!(ours_have.as_bytes(), &[0b0100_0000]);
    write_message(&mut stream, &Message::have(1)).await.unwrap();

    assert_eq!(seeder.await.unwrap(), 1);
}
