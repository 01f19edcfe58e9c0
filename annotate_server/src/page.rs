//! The single page served at `/`.
//!
//! The upload control posts to `/upload`, then points the output image at `/stream` so every
//! new part of the multipart response replaces the displayed frame. `/status` is polled for the
//! messages shown below the image.

pub const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="utf-8">
    <title>Real-Time Sports Analytics</title>
    <style>
        body {
            background-color: #F0F2F6;
            font-family: sans-serif;
            margin: 0 auto;
            max-width: 730px;
            padding: 2rem 1rem;
        }
        h1 {
            color: #FF6347;
        }
        button {
            background-color: #FF6347;
            border: none;
            border-radius: 4px;
            color: white;
            padding: 0.5rem 1rem;
        }
        #frame {
            display: none;
            width: 100%;
        }
        #status {
            font-size: 1.2rem;
            font-weight: bold;
        }
    </style>
</head>
<body>
    <h1>&#9917; Real-Time Sports Analytics with YOLOv5</h1>
    <h3>Object Detection and Player Tracking on Videos</h3>

    <form id="upload">
        <label for="video">Choose a video...</label>
        <input id="video" name="video" type="file" accept=".mp4,.mov,.avi,.mkv">
        <button type="submit">Process</button>
    </form>

    <img id="frame" alt="Annotated frame">
    <p id="status">Upload a video to start processing.</p>

    <hr>
    <p><em>Developed using Rust, YOLOv5 and FFmpeg.</em></p>

    <script>
        const form = document.getElementById("upload");
        const frame = document.getElementById("frame");
        const statusLine = document.getElementById("status");

        function pollStatus(id) {
            fetch("/status?name=" + encodeURIComponent(id))
                .then((resp) => resp.json())
                .then((status) => {
                    if (status.message) {
                        statusLine.textContent = status.message;
                    } else {
                        statusLine.textContent = "Processing... " + status.frames + " frames";
                    }
                    if (status.state !== "complete" && status.state !== "failed") {
                        setTimeout(() => pollStatus(id), 500);
                    }
                });
        }

        form.addEventListener("submit", (event) => {
            event.preventDefault();
            const body = new FormData(form);
            fetch("/upload", { method: "POST", body })
                .then((resp) => resp.ok ? resp.json() : resp.text().then((text) => Promise.reject(text)))
                .then((status) => {
                    frame.style.display = "block";
                    frame.src = "/stream?name=" + encodeURIComponent(status.id);
                    pollStatus(status.id);
                })
                .catch((message) => {
                    statusLine.textContent = message;
                });
        });
    </script>
</body>
</html>
"#;

#[cfg(test)]
mod test {
    use super::INDEX_HTML;
    use common::{ACCEPTED_FORMATS, IDLE_PROMPT};

    #[test]
    fn test_page_accepts_all_formats() {
        for format in ACCEPTED_FORMATS {
            assert!(INDEX_HTML.contains(&format!(".{}", format)));
        }
    }

    #[test]
    fn test_page_starts_idle() {
        assert!(INDEX_HTML.contains(IDLE_PROMPT));
        assert!(INDEX_HTML.contains(r#"name="video""#));
    }
}
